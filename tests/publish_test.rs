mod common;

use common::{
    connect_ws, recv_event_of_type, start_server, test_config, test_state, StaticMembers,
    StaticTokens,
};

fn state() -> realtime_api::AppState {
    test_state(
        test_config(),
        StaticTokens::new([("tok-u1", "U1")]),
        StaticMembers::new([("C1", "U1")]),
    )
}

#[tokio::test]
async fn internal_publish_requires_the_shared_secret() {
    let addr = start_server(state()).await;
    let client = reqwest::Client::new();

    let body = serde_json::json!({
        "type": "post_created",
        "episode_id": "E1",
        "post": { "id": "p1" },
    });

    let resp = client
        .post(format!("http://{addr}/internal/events"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let resp = client
        .post(format!("http://{addr}/internal/events"))
        .bearer_auth("wrong-token")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn committed_domain_write_fans_out_to_the_episode_room() {
    let addr = start_server(state()).await;

    let mut ws = connect_ws(addr, "/ws/discussions/E7").await;
    recv_event_of_type(&mut ws, "subscribed").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/internal/events"))
        .bearer_auth("internal-test-token")
        .json(&serde_json::json!({
            "type": "post_created",
            "episode_id": "E7",
            "post": { "id": "p42", "body": "great scene" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    let event = recv_event_of_type(&mut ws, "post_created").await;
    assert_eq!(event["payload"]["episode_id"], "E7");
    assert_eq!(event["payload"]["post"]["id"], "p42");
}

#[tokio::test]
async fn dm_read_update_fans_out_to_the_conversation_room() {
    let addr = start_server(state()).await;

    let mut ws = connect_ws(addr, "/ws/dm/C1?token=tok-u1").await;
    recv_event_of_type(&mut ws, "subscribed").await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/internal/events"))
        .bearer_auth("internal-test-token")
        .json(&serde_json::json!({
            "type": "dm_read_updated",
            "conversation_id": "C1",
            "user_id": "U1",
            "last_read_post_id": "p42",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    let event = recv_event_of_type(&mut ws, "dm_read_updated").await;
    assert_eq!(event["payload"]["conversation_id"], "C1");
    assert_eq!(event["payload"]["last_read_post_id"], "p42");
}

#[tokio::test]
async fn unknown_event_type_is_rejected() {
    let addr = start_server(state()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{addr}/internal/events"))
        .bearer_auth("internal-test-token")
        .json(&serde_json::json!({ "type": "survey_completed", "payload": {} }))
        .send()
        .await
        .unwrap();
    // Not part of the closed domain catalog: the body fails to parse.
    assert_eq!(resp.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
}
