//! Search proxy endpoint

use axum::{
    extract::{Request, State},
    response::Response,
};

use crate::error::Result;
use crate::server::state::AppState;

/// POST /search - Forward the raw request to the search mirror
///
/// Bodies stream through untouched in both directions. If the client goes
/// away, axum drops this future and the upstream request with it.
pub async fn proxy_search(State(state): State<AppState>, request: Request) -> Result<Response> {
    state.mirror().query(request).await
}

#[cfg(test)]
mod tests {
    use crate::providers::SearchMirror;
    use crate::testing::{read_json, Fixture};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_search_is_proxied() {
        let fixture = Fixture::new().await;
        let record = fixture.store_document(b"findable", "f.txt", "text/plain").await;
        fixture.mirror.upsert(&record).await.unwrap();

        let response = fixture
            .router()
            .oneshot(
                Request::post("/search")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"q":"findable"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let answer = read_json(response).await;
        assert_eq!(answer["query"]["q"], "findable");
        assert_eq!(answer["hits"][0]["address"], record.address().as_str());
    }
}
