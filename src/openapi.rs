use crate::error::ApiErrorBody;
use crate::models::{
    AnonymousPost, Category, LatLng, MapCluster, Message, NewCategory, NewMessage, NewNotification, Notification,
    PublicMap, PublicPost, PublishRequest,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::signup,
        crate::routes::login,
        crate::routes::logout,
        crate::routes::session,
        crate::routes::refresh_token,
        crate::routes::list_categories,
        crate::routes::create_category,
        crate::routes::delete_category,
        crate::routes::list_messages,
        crate::routes::create_message,
        crate::routes::delete_message,
        crate::routes::list_public_posts,
        crate::routes::public_map,
        crate::routes::list_own_public_posts,
        crate::routes::publish_message,
        crate::routes::delete_public_post,
        crate::routes::list_notifications,
        crate::routes::mark_notification_read,
        crate::routes::notification_stream,
        crate::routes::ingest_notification,
    ),
    components(schemas(
        Category, NewCategory, Message, NewMessage,
        PublicPost, PublishRequest, AnonymousPost, MapCluster, PublicMap, LatLng,
        Notification, NewNotification, ApiErrorBody,
        crate::routes::Credentials, crate::routes::SessionUser,
        crate::routes::LoginResponse, crate::routes::TokenResponse
    )),
    tags(
        (name = "auth", description = "Sign-up, sign-in and sessions"),
        (name = "journal", description = "Private categories and messages"),
        (name = "public", description = "Anonymous posts on the public map"),
        (name = "notifications", description = "Nearby similar notifications"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_stream_is_documented_as_sse() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let ok = &doc["paths"]["/api/v1/notifications/stream"]["get"]["responses"]["200"];
        assert!(ok["content"]["text/event-stream"].is_object(), "{ok}");
    }
}
