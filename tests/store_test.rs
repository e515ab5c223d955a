//! Write and read behavior against a live Message DB.

mod common;

use messagedb::{
    GetCategoryOptions, GetStreamOptions, MessageDbError, ProposedMessage, StreamIdentifier,
    ANY_VERSION, NO_STREAM_VERSION,
};
use std::collections::HashSet;

#[tokio::test]
async fn test_write_expected_version_sequence() {
    let Some(client) = common::connect().await else {
        eprintln!("MESSAGE_DB_URL not set; skipping");
        return;
    };

    let stream = StreamIdentifier::new(common::unique_category("occ"), "s1");
    let message = ProposedMessage::new("T", &"d").unwrap();

    // first write creates the stream at version 0
    let version = client
        .write_message(&stream, &message, NO_STREAM_VERSION)
        .await
        .unwrap();
    assert_eq!(version, 0);

    // the stream now exists, so expecting "no stream" must fail
    let message = ProposedMessage::new("T", &"d").unwrap();
    let err = client
        .write_message(&stream, &message, NO_STREAM_VERSION)
        .await
        .unwrap_err();
    assert!(matches!(err, MessageDbError::UnexpectedStreamVersion));

    // skipping the check always appends
    let message = ProposedMessage::new("T", &"d").unwrap();
    let version = client
        .write_message(&stream, &message, ANY_VERSION)
        .await
        .unwrap();
    assert_eq!(version, 1);
}

#[tokio::test]
async fn test_write_then_read_back() {
    let Some(client) = common::connect().await else {
        eprintln!("MESSAGE_DB_URL not set; skipping");
        return;
    };

    let stream = StreamIdentifier::new(common::unique_category("rb"), "s1");
    let message = ProposedMessage::new("Opened", &serde_json::json!({"owner": "a"})).unwrap();
    let id = message.id.to_string();

    client
        .write_message(&stream, &message, NO_STREAM_VERSION)
        .await
        .unwrap();

    assert_eq!(client.get_stream_version(&stream).await.unwrap(), 0);

    let messages = client
        .get_stream_messages(&stream, &GetStreamOptions::new())
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, id);
    assert_eq!(messages[0].version, 0);
    assert_eq!(messages[0].stream, stream);

    let last = client
        .get_last_stream_message(&stream)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.id, id);
}

#[tokio::test]
async fn test_partial_stream_read() {
    let Some(client) = common::connect().await else {
        eprintln!("MESSAGE_DB_URL not set; skipping");
        return;
    };

    let stream = StreamIdentifier::new(common::unique_category("part"), "s2");
    common::populate(&client, &stream, 10).await;

    let messages = client
        .get_stream_messages(
            &stream,
            &GetStreamOptions::new().from_version(5).batch_size(5),
        )
        .await
        .unwrap();

    let versions: Vec<i64> = messages.iter().map(|m| m.version).collect();
    assert_eq!(versions, vec![5, 6, 7, 8, 9]);
}

#[tokio::test]
async fn test_missing_stream_version() {
    let Some(client) = common::connect().await else {
        eprintln!("MESSAGE_DB_URL not set; skipping");
        return;
    };

    let stream = StreamIdentifier::new(common::unique_category("none"), "missing");
    assert_eq!(
        client.get_stream_version(&stream).await.unwrap(),
        NO_STREAM_VERSION
    );
    assert!(client
        .get_last_stream_message(&stream)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_consumer_group_reads_are_disjoint_and_total() {
    let Some(client) = common::connect().await else {
        eprintln!("MESSAGE_DB_URL not set; skipping");
        return;
    };

    let category = common::unique_category("cg");
    for s in 0..5 {
        let stream = StreamIdentifier::new(category.clone(), format!("s{s}"));
        common::populate(&client, &stream, 10).await;
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for member in 0..2 {
        let messages = client
            .get_category_messages(
                &category,
                &GetCategoryOptions::new().consumer_group(member, 2),
            )
            .await
            .unwrap();
        for message in messages {
            assert!(
                seen.insert(message.id.clone()),
                "message {} read by both members",
                message.id
            );
            total += 1;
        }
    }
    assert_eq!(total, 50);
}

#[tokio::test]
async fn test_correlation_filter() {
    let Some(client) = common::connect().await else {
        eprintln!("MESSAGE_DB_URL not set; skipping");
        return;
    };

    let category = common::unique_category("corr");
    let origin = common::unique_category("origin");
    let stream = StreamIdentifier::new(category.clone(), "s1");

    let plain = ProposedMessage::new("T", &"d").unwrap();
    client.write_message(&stream, &plain, ANY_VERSION).await.unwrap();

    let correlated = ProposedMessage::new("T", &"d")
        .unwrap()
        .with_metadata(&serde_json::json!({
            "correlationStreamName": format!("{origin}-1"),
        }))
        .unwrap();
    let correlated_id = correlated.id.to_string();
    client
        .write_message(&stream, &correlated, ANY_VERSION)
        .await
        .unwrap();

    let messages = client
        .get_category_messages(&category, &GetCategoryOptions::new().correlation(&origin))
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, correlated_id);
}

#[tokio::test]
async fn test_validation_rejected_before_hitting_the_store() {
    let Some(client) = common::connect().await else {
        eprintln!("MESSAGE_DB_URL not set; skipping");
        return;
    };

    let stream = StreamIdentifier::new("cat", "s1");
    let err = client
        .get_stream_messages(&stream, &GetStreamOptions::new().batch_size(0))
        .await
        .unwrap_err();
    assert!(matches!(err, MessageDbError::InvalidOptions(_)));

    let err = client
        .get_category_messages("cat", &GetCategoryOptions::new().from_position(-1))
        .await
        .unwrap_err();
    assert!(matches!(err, MessageDbError::InvalidOptions(_)));

    let err = client
        .get_category_messages("bad-category", &GetCategoryOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MessageDbError::InvalidCategory));
}
