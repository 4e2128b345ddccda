use actix_web::{dev::ServiceRequest, Error};
use actix_web::dev::Transform;
use actix_service::{Service, forward_ready};
use actix_web::HttpMessage; // Added to bring `extensions_mut` into scope
use futures::future::{ok, Ready, LocalBoxFuture};
use jsonwebtoken::{decode, DecodingKey, Validation, Algorithm};
use std::rc::Rc;

use crate::error::AppError;
use crate::models::{AuthUser, Claims};

// Middleware factory
pub struct AuthMiddleware {
    secret: String,
    optional: bool,
}

impl AuthMiddleware {
    /// Every request must carry a valid bearer token.
    pub fn new(secret: String) -> Self {
        AuthMiddleware { secret, optional: false }
    }

    /// Requests without an Authorization header pass through as guests;
    /// a header that is present must still be valid.
    pub fn optional(secret: String) -> Self {
        AuthMiddleware { secret, optional: true }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = actix_web::dev::ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = Error;
    type Transform = AuthMiddlewareMiddleware<S>;
    type InitError = ();

    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddlewareMiddleware {
            service: Rc::new(service),
            secret: self.secret.clone(),
            optional: self.optional,
        })
    }
}

pub struct AuthMiddlewareMiddleware<S> {
    service: Rc<S>,
    secret: String,
    optional: bool,
}

fn authenticate(header: &str, secret: &str) -> Result<AuthUser, AppError> {
    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        log::debug!("Rejected authorization scheme");
        AppError::Unauthorized
    })?;

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| AuthUser {
        id: data.claims.sub,
        role: data.claims.role,
    })
    .map_err(|e| {
        log::debug!("Rejected token: {}", e);
        AppError::Unauthorized
    })
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareMiddleware<S>
where
    S: Service<ServiceRequest, Response = actix_web::dev::ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = actix_web::dev::ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let secret = self.secret.clone();
        let service = self.service.clone();
        let optional = self.optional;

        Box::pin(async move {
            match req.headers().get("Authorization") {
                Some(auth_header) => {
                    let auth_str = auth_header
                        .to_str()
                        .map_err(|_| AppError::Unauthorized)?;
                    let user = authenticate(auth_str, &secret)?;
                    req.extensions_mut().insert(user);
                    service.call(req).await
                }
                None if optional => service.call(req).await,
                None => Err(AppError::Unauthorized.into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::test_support::{token, JWT_SECRET};
    use actix_web::{test, web, App, HttpRequest, HttpResponse};

    async fn whoami(req: HttpRequest) -> HttpResponse {
        match req.extensions().get::<AuthUser>() {
            Some(user) => HttpResponse::Ok().body(format!("{}:{:?}", user.id, user.role)),
            None => HttpResponse::Ok().body("guest"),
        }
    }

    #[actix_web::test]
    async fn valid_token_exposes_user_and_role() {
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(JWT_SECRET.to_string()))
                .route("/", web::get().to(whoami)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/")
            .insert_header(("Authorization", format!("Bearer {}", token("u7", Role::Admin))))
            .to_request();
        let body = test::call_and_read_body(&app, req).await;
        assert_eq!(body, "u7:Admin");
    }

    #[actix_web::test]
    async fn required_mode_rejects_missing_and_bad_tokens() {
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::new(JWT_SECRET.to_string()))
                .route("/", web::get().to(whoami)),
        )
        .await;

        let missing = test::TestRequest::get().uri("/").to_request();
        let err = test::try_call_service(&app, missing).await.unwrap_err();
        assert_eq!(err.as_response_error().status_code(), 401);

        let forged = test::TestRequest::get()
            .uri("/")
            .insert_header(("Authorization", "Bearer not.a.jwt"))
            .to_request();
        let err = test::try_call_service(&app, forged).await.unwrap_err();
        let body = actix_web::body::to_bytes(err.error_response().into_body())
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "unauthorized");
        assert_eq!(json["message"], "Login required");
    }

    #[actix_web::test]
    async fn optional_mode_lets_guests_through_but_not_forgeries() {
        let app = test::init_service(
            App::new()
                .wrap(AuthMiddleware::optional(JWT_SECRET.to_string()))
                .route("/", web::get().to(whoami)),
        )
        .await;

        let guest = test::TestRequest::get().uri("/").to_request();
        assert_eq!(test::call_and_read_body(&app, guest).await, "guest");

        let wrong_scheme = test::TestRequest::get()
            .uri("/")
            .insert_header(("Authorization", "Basic dXNlcjpwYXNz"))
            .to_request();
        assert!(test::try_call_service(&app, wrong_scheme).await.is_err());
    }
}
