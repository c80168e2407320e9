//! End-to-end retrieval against a loopback archive.

mod common;

use std::sync::Arc;

use common::{ArchiveScript, BlockStep, MockArchive, closed_port, config_for, gateway_for};
use ddsbridge_core::config::{NetlistConfig, NetlistItemConfig};
use ddsbridge_core::dds::MessageType;
use ddsbridge_core::sources::StaticWorkerRegistry;
use ddsbridge_core::{Gateway, GatewayError, SearchCriteria, SessionKey};

fn no_workers() -> Arc<StaticWorkerRegistry> {
    Arc::new(StaticWorkerRegistry::new())
}

fn recent() -> SearchCriteria {
    SearchCriteria {
        since: Some("now - 1 hour".into()),
        ..SearchCriteria::default()
    }
}

fn block(count: usize, more: bool) -> BlockStep {
    BlockStep::Block {
        prefix: "P",
        count,
        more,
    }
}

fn ids(block: &ddsbridge_core::RawMessageBlock) -> Vec<String> {
    block
        .messages
        .iter()
        .filter_map(|m| m.platform_id.clone())
        .collect()
}

#[tokio::test]
async fn pages_until_exhausted_on_one_connection() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(2, true), block(1, false)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("web-1");
    gw.submit_search_criteria(&session, recent()).await;

    let first = gw.pull_next_message_block(&session).await.unwrap();
    assert_eq!(ids(&first), vec!["P0", "P1"]);
    assert!(first.more_to_follow);
    assert!(gw.cache().retrieval().contains(&session).await);

    let second = gw.pull_next_message_block(&session).await.unwrap();
    assert_eq!(ids(&second), vec!["P0"]);
    assert!(!second.more_to_follow);

    assert_eq!(archive.connections(), 1);
    assert!(!gw.cache().retrieval().contains(&session).await);
    assert_eq!(
        &archive.request_types()[..4],
        &[
            MessageType::Hello,
            MessageType::Criteria,
            MessageType::MessageBlockExt,
            MessageType::MessageBlockExt
        ]
    );

    let err = gw.pull_next_message_block(&session).await.unwrap_err();
    assert!(matches!(err, GatewayError::MissingPrerequisite(_)));
}

#[tokio::test]
async fn end_of_window_is_an_empty_final_block() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(3, true), BlockStep::EndOfWindow],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, recent()).await;

    assert_eq!(gw.pull_next_message_block(&session).await.unwrap().messages.len(), 3);
    let last = gw.pull_next_message_block(&session).await.unwrap();
    assert!(last.messages.is_empty());
    assert!(!last.more_to_follow);
    assert!(!gw.cache().retrieval().contains(&session).await);
}

#[tokio::test]
async fn resubmitting_criteria_forces_a_new_connection() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(1, true)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("s");

    gw.submit_search_criteria(&session, recent()).await;
    gw.pull_next_message_block(&session).await.unwrap();
    gw.submit_search_criteria(&session, recent()).await;
    assert!(!gw.cache().retrieval().contains(&session).await);
    gw.pull_next_message_block(&session).await.unwrap();

    assert_eq!(archive.connections(), 2);
    assert_eq!(archive.requests_of(MessageType::Criteria).len(), 2);
}

fn platforms(list: &[&str]) -> SearchCriteria {
    SearchCriteria {
        platform_ids: list.iter().map(|s| (*s).to_string()).collect(),
        ..recent()
    }
}

fn criteria_sent(archive: &MockArchive) -> Vec<Vec<String>> {
    archive
        .requests_of(MessageType::Criteria)
        .iter()
        .map(|frame| frame.decode_json::<SearchCriteria>().unwrap().platform_ids)
        .collect()
}

#[tokio::test]
async fn pull_queued_behind_resubmit_uses_new_criteria() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(1, true)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = Arc::new(gateway_for(archive.port, no_workers()));
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, platforms(&["OLD"])).await;

    // Queue a resubmit and then a pull behind a busy session slot.
    let busy = gw.cache().retrieval().slot(session.clone()).await;
    let resubmit = {
        let (gw, session) = (Arc::clone(&gw), session.clone());
        tokio::spawn(async move { gw.submit_search_criteria(&session, platforms(&["NEW"])).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let pull = {
        let (gw, session) = (Arc::clone(&gw), session.clone());
        tokio::spawn(async move { gw.pull_next_message_block(&session).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    drop(busy);

    resubmit.await.unwrap();
    pull.await.unwrap().unwrap();
    assert_eq!(gw.get_search_criteria(&session).unwrap().platform_ids, vec!["NEW"]);
    assert_eq!(criteria_sent(&archive), vec![vec!["NEW".to_string()]]);

    gw.pull_next_message_block(&session).await.unwrap();
    assert_eq!(criteria_sent(&archive), vec![vec!["NEW".to_string()]]);
    assert_eq!(archive.connections(), 1);
}

#[tokio::test]
async fn pull_queued_behind_session_end_opens_nothing() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(1, true)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = Arc::new(gateway_for(archive.port, no_workers()));
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, recent()).await;

    let busy = gw.cache().retrieval().slot(session.clone()).await;
    let pull = {
        let (gw, session) = (Arc::clone(&gw), session.clone());
        tokio::spawn(async move { gw.pull_next_message_block(&session).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    let end = {
        let (gw, session) = (Arc::clone(&gw), session.clone());
        tokio::spawn(async move { gw.end_session(&session).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    drop(busy);

    let err = pull.await.unwrap().unwrap_err();
    assert!(matches!(err, GatewayError::MissingPrerequisite(_)));
    assert_eq!(end.await.unwrap(), 0);
    assert_eq!(archive.connections(), 0);
    assert_eq!(gw.cache().retrieval().slot_count(), 0);
}

#[tokio::test]
async fn unknown_netlists_are_skipped() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(1, false)],
        ..ArchiveScript::default()
    })
    .await;
    let mut config = config_for(archive.port);
    config.netlists.push(NetlistConfig {
        name: "goes-east".into(),
        transport_medium_type: Some("goes".into()),
        items: vec![NetlistItemConfig {
            transport_id: "CE1234AB".into(),
            platform_name: Some("Boulder Creek".into()),
            description: None,
        }],
    });
    let gw = Gateway::from_config(&config, no_workers());
    let session = SessionKey::from("s");
    gw.submit_search_criteria(
        &session,
        SearchCriteria {
            netlist_names: vec!["goes-east".into(), "nowhere".into()],
            ..recent()
        },
    )
    .await;

    gw.pull_next_message_block(&session).await.unwrap();
    let pushed = archive.requests_of(MessageType::PutNetlist);
    assert_eq!(pushed.len(), 1);
    assert!(pushed[0].body_text().contains("CE1234AB"));
}

#[tokio::test]
async fn single_message_leaves_no_client_behind() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(2, true)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("s");

    let msg = gw.get_single_message(&session, "CE1234AB").await.unwrap();
    assert_eq!(msg.platform_id.as_deref(), Some("P0"));
    assert!(!gw.cache().retrieval().contains(&session).await);

    let criteria = archive.requests_of(MessageType::Criteria);
    assert!(criteria[0].body_text().contains("CE1234AB"));
    assert!(criteria[0].body_text().contains("now - 12 hours"));
    assert_eq!(
        gw.get_search_criteria(&session).unwrap().platform_ids,
        vec!["CE1234AB"]
    );
}

#[tokio::test]
async fn single_message_not_found_when_window_empty() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![BlockStep::EndOfWindow],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("s");

    let err = gw.get_single_message(&session, "CE1234AB").await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound(_)), "{err:?}");
    assert_eq!(err.status_code(), 404);
    assert!(!gw.cache().retrieval().contains(&session).await);
}

#[tokio::test]
async fn unreachable_archive_is_bad_config() {
    let gw = gateway_for(closed_port().await, no_workers());
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, recent()).await;

    let err = gw.pull_next_message_block(&session).await.unwrap_err();
    assert!(matches!(&err, GatewayError::BadConfig { source_name, .. } if source_name == "mock"));
    assert!(!gw.cache().retrieval().contains(&session).await);
    // Criteria survive so the caller can retry.
    assert!(gw.get_search_criteria(&session).is_ok());
}

#[tokio::test]
async fn server_error_is_protocol_failure_in_phase() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![BlockStep::ServerError(12), block(1, true)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, recent()).await;

    let err = gw.pull_next_message_block(&session).await.unwrap_err();
    assert!(
        matches!(&err, GatewayError::Protocol { phase, .. } if phase == "getting message block"),
        "{err:?}"
    );
    assert!(!gw.cache().retrieval().contains(&session).await);

    // Next pull starts over on a fresh connection; its script restarts too.
    let retry = gw.pull_next_message_block(&session).await;
    assert!(retry.is_err());
    assert_eq!(archive.connections(), 2);
}

#[tokio::test]
async fn rejected_criteria_reports_searchcrit_phase() {
    let archive = MockArchive::start(ArchiveScript {
        reject_criteria: Some(7),
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, recent()).await;

    let err = gw.pull_next_message_block(&session).await.unwrap_err();
    assert!(
        matches!(&err, GatewayError::Protocol { phase, .. } if phase == "sending searchcrit"),
        "{err:?}"
    );
    assert_eq!(err.status_code(), 409);
    assert!(!gw.cache().retrieval().contains(&session).await);
}

#[tokio::test]
async fn hangup_mid_pull_is_socket_closed() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![BlockStep::Hangup],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, recent()).await;

    let err = gw.pull_next_message_block(&session).await.unwrap_err();
    assert!(matches!(err, GatewayError::SocketClosed { .. }), "{err:?}");
    assert!(!gw.cache().retrieval().contains(&session).await);
}

#[tokio::test]
async fn concurrent_pulls_for_one_session_share_a_connection() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(1, true), block(1, true)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = Arc::new(gateway_for(archive.port, no_workers()));
    let session = SessionKey::from("double-click");
    gw.submit_search_criteria(&session, recent()).await;

    let a = {
        let gw = Arc::clone(&gw);
        let session = session.clone();
        tokio::spawn(async move { gw.pull_next_message_block(&session).await })
    };
    let b = {
        let gw = Arc::clone(&gw);
        let session = session.clone();
        tokio::spawn(async move { gw.pull_next_message_block(&session).await })
    };
    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert_eq!(archive.connections(), 1);
}

#[tokio::test]
async fn sessions_get_their_own_connections() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(1, true)],
        ..ArchiveScript::default()
    })
    .await;
    let gw = gateway_for(archive.port, no_workers());
    let (a, b) = (SessionKey::from("a"), SessionKey::from("b"));
    gw.submit_search_criteria(&a, recent()).await;
    gw.submit_search_criteria(&b, recent()).await;

    let (ra, rb) = tokio::join!(gw.pull_next_message_block(&a), gw.pull_next_message_block(&b));
    assert!(ra.is_ok() && rb.is_ok());
    assert_eq!(archive.connections(), 2);

    assert_eq!(gw.end_session(&a).await, 1);
    assert!(!gw.cache().retrieval().contains(&a).await);
    assert!(gw.cache().retrieval().contains(&b).await);
}

#[tokio::test]
async fn archive_status_is_one_shot() {
    let archive = MockArchive::start(ArchiveScript::default()).await;
    let gw = gateway_for(archive.port, no_workers());

    let status = gw.get_archive_status(None).await.unwrap();
    assert_eq!(status.hostname.as_deref(), Some("mock-lrgs"));
    assert_eq!(gw.cache().retrieval().slot_count(), 0);

    let err = gw.get_archive_status(Some("elsewhere")).await.unwrap_err();
    assert!(matches!(err, GatewayError::BadConfig { .. }));
}

#[tokio::test]
async fn background_reaper_closes_idle_retrievals() {
    let archive = MockArchive::start(ArchiveScript {
        blocks: vec![block(1, true)],
        ..ArchiveScript::default()
    })
    .await;
    let mut config = config_for(archive.port);
    config.gateway.idle_client_secs = 0;
    config.gateway.reap_interval_secs = 1;
    let gw = Arc::new(Gateway::from_config(&config, no_workers()));
    let session = SessionKey::from("s");
    gw.submit_search_criteria(&session, recent()).await;
    gw.pull_next_message_block(&session).await.unwrap();
    assert!(gw.cache().retrieval().contains(&session).await);

    let reaper = gw.spawn_reaper();
    tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
    assert!(!gw.cache().retrieval().contains(&session).await);
    reaper.shutdown().await;

    // Criteria outlive the reaped connection; the next pull reconnects.
    gw.pull_next_message_block(&session).await.unwrap();
    assert_eq!(archive.connections(), 2);
}
