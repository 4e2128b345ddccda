use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Pricing and order-placement knobs shared by the payment and order paths.
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    pub currency: String,
    pub shipping_fee_cents: i64,
    /// Subtotals strictly above this ship free.
    pub free_shipping_threshold_cents: i64,
    pub max_line_quantity: i64,
    pub max_lines: usize,
    pub order_number_max_attempts: u32,
    /// When set, placing an order absorbs the buyer's reservations instead of
    /// decrementing stock a second time. Off by default: the order-time decrement
    /// stays independent of any hold until product owners opt in.
    pub consume_reservations: bool,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        CheckoutConfig {
            currency: "usd".to_string(),
            shipping_fee_cents: 6000,
            free_shipping_threshold_cents: 100_000,
            max_line_quantity: 99,
            max_lines: 50,
            order_number_max_attempts: 10,
            consume_reservations: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub gateway: GatewayConfig,
    pub checkout: CheckoutConfig,
    pub reservation_ttl: chrono::Duration,
    /// `None` leaves reaping to the admin endpoint (external cron).
    pub reaper_interval: Option<Duration>,
}

impl Config {
    /// Reads configuration from the process environment. Call `dotenv` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));
        let defaults = CheckoutConfig::default();

        let checkout = CheckoutConfig {
            currency: lookup("CURRENCY")
                .unwrap_or(defaults.currency)
                .to_lowercase(),
            shipping_fee_cents: parse_or(&lookup, "SHIPPING_FEE_CENTS", defaults.shipping_fee_cents)?,
            free_shipping_threshold_cents: parse_or(
                &lookup,
                "FREE_SHIPPING_THRESHOLD_CENTS",
                defaults.free_shipping_threshold_cents,
            )?,
            max_line_quantity: parse_or(&lookup, "MAX_LINE_QUANTITY", defaults.max_line_quantity)?,
            max_lines: defaults.max_lines,
            order_number_max_attempts: parse_or(
                &lookup,
                "ORDER_NUMBER_MAX_ATTEMPTS",
                defaults.order_number_max_attempts,
            )?,
            consume_reservations: parse_or(
                &lookup,
                "ORDER_CONSUMES_RESERVATIONS",
                defaults.consume_reservations,
            )?,
        };
        if checkout.order_number_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "ORDER_NUMBER_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }
        if checkout.max_line_quantity < 1 {
            return Err(ConfigError::Invalid {
                name: "MAX_LINE_QUANTITY",
                value: checkout.max_line_quantity.to_string(),
            });
        }

        let ttl_secs: i64 = parse_or(&lookup, "RESERVATION_TTL_SECS", 900)?;
        if ttl_secs < 1 {
            return Err(ConfigError::Invalid {
                name: "RESERVATION_TTL_SECS",
                value: ttl_secs.to_string(),
            });
        }
        let reaper_secs: u64 = parse_or(&lookup, "REAPER_INTERVAL_SECS", 60)?;

        Ok(Config {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".into()),
            database_url: required("DATABASE_URL")?,
            database_name: lookup("DATABASE_NAME").unwrap_or_else(|| "shop".into()),
            jwt_secret: required("JWT_SECRET")?,
            gateway: GatewayConfig {
                base_url: lookup("PAYMENT_GATEWAY_URL")
                    .unwrap_or_else(|| "https://api.stripe.com".into()),
                secret_key: required("PAYMENT_SECRET_KEY")?,
            },
            checkout,
            reservation_ttl: chrono::Duration::seconds(ttl_secs),
            reaper_interval: (reaper_secs > 0).then(|| Duration::from_secs(reaper_secs)),
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("DATABASE_URL", "mongodb://localhost:27017/?replicaSet=rs0"),
        ("JWT_SECRET", "secret"),
        ("PAYMENT_SECRET_KEY", "sk_test"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config = Config::from_lookup(lookup_from(&BASE)).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.checkout.shipping_fee_cents, 6000);
        assert_eq!(config.checkout.free_shipping_threshold_cents, 100_000);
        assert_eq!(config.reservation_ttl, chrono::Duration::minutes(15));
        assert_eq!(config.reaper_interval, Some(Duration::from_secs(60)));
        assert!(!config.checkout.consume_reservations);
    }

    #[test]
    fn missing_secret_is_reported_by_name() {
        let err = Config::from_lookup(lookup_from(&BASE[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PAYMENT_SECRET_KEY")));
    }

    #[test]
    fn zero_interval_disables_reaper_and_flags_parse() {
        let mut pairs = BASE.to_vec();
        pairs.push(("REAPER_INTERVAL_SECS", "0"));
        pairs.push(("CURRENCY", "EUR"));
        pairs.push(("ORDER_CONSUMES_RESERVATIONS", "true"));
        let config = Config::from_lookup(lookup_from(&pairs)).unwrap();
        assert_eq!(config.reaper_interval, None);
        assert_eq!(config.checkout.currency, "eur");
        assert!(config.checkout.consume_reservations);
    }

    #[test]
    fn unparsable_numbers_are_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("SHIPPING_FEE_CENTS", "sixty"));
        let err = Config::from_lookup(lookup_from(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SHIPPING_FEE_CENTS", .. }));
    }

    #[test]
    fn out_of_range_limits_are_rejected() {
        for (name, value) in [
            ("RESERVATION_TTL_SECS", "-5"),
            ("RESERVATION_TTL_SECS", "0"),
            ("MAX_LINE_QUANTITY", "0"),
            ("ORDER_NUMBER_MAX_ATTEMPTS", "0"),
        ] {
            let mut pairs = BASE.to_vec();
            pairs.push((name, value));
            match Config::from_lookup(lookup_from(&pairs)) {
                Err(ConfigError::Invalid { name: rejected, .. }) => assert_eq!(rejected, name),
                other => panic!("{}={} was accepted: {:?}", name, value, other.map(|_| ())),
            }
        }
    }
}
