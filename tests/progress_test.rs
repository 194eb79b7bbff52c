mod common;

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

use common::{wait_for, Harness, WAIT};
use nodeodm::{ProgressReceiver, TaskManager};


async fn receiver() -> ProgressReceiver {
    ProgressReceiver::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap()
}

async fn send(to: SocketAddr, datagrams: &[&str]) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for datagram in datagrams {
        socket.send_to(datagram.as_bytes(), to).await.unwrap();
    }
}


#[tokio::test]
async fn malformed_datagrams_are_dropped() {
    let receiver = receiver().await;
    let mut events = receiver.subscribe();

    send(
        receiver.local_addr(),
        &[
            "garbage",
            "PGUP/12/job",
            "PGUP/12/job/not-a-number",
            "PGDOWN/12/job/50",
            "PGUP/12/job/50/extra",
            "PGUP/12/job-1/42.5",
        ],
    )
    .await;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.job_id, "job-1");
    assert_eq!(event.percent, 42.5);
}

#[tokio::test]
async fn every_subscriber_sees_each_event() {
    let receiver = receiver().await;
    let mut first = receiver.subscribe();
    let mut second = receiver.subscribe();

    send(receiver.local_addr(), &["PGUP/1/abc/10"]).await;

    for events in [&mut first, &mut second] {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.job_id, "abc");
        assert_eq!(event.percent, 10.0);
    }
}

#[tokio::test]
async fn manager_routes_progress_to_tasks() {
    let harness = Harness::new();
    let manager = TaskManager::new(harness.ctx.clone());
    let task = harness.ready_task(vec![]).await;
    manager.add_new(task.clone()).await;

    let receiver = receiver().await;
    manager.listen_progress(receiver.subscribe());

    let forward = format!("PGUP/7/{}/64", task.id());
    let backward = format!("PGUP/7/{}/12", task.id());
    send(receiver.local_addr(), &[forward.as_str(), backward.as_str(), "PGUP/7/unknown-task/99"]).await;

    let check = task.clone();
    assert!(wait_for(WAIT, || {
        let task = check.clone();
        async move { task.progress().await == 64.0 }
    })
    .await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(task.progress().await, 64.0);
}

#[tokio::test]
async fn listener_attached_before_startup_tracks_restored_tasks() {
    let harness = Harness::new();
    let id = common::new_id();
    harness.create_project(&id, 1);
    let now = chrono::Utc::now().timestamp_millis();
    let snapshot = serde_json::json!([{
        "uuid": id,
        "name": "interrupted",
        "dateCreated": now,
        "dateStarted": now,
        "processingTime": 0,
        "status": { "code": 20 },
        "options": [{ "name": "sleep", "value": 5 }]
    }]);
    std::fs::write(harness.ctx.config.snapshot_path(), snapshot.to_string()).unwrap();

    let receiver = receiver().await;
    let manager = TaskManager::new(harness.ctx.clone());
    manager.listen_progress(receiver.subscribe());
    manager.initialize().await.unwrap();

    let task = manager.find(&id).await.unwrap();
    assert!(task.running_time().await.is_some());

    let report = format!("PGUP/7/{}/30", id);
    send(receiver.local_addr(), &[report.as_str()]).await;
    let check = task.clone();
    assert!(wait_for(WAIT, || {
        let task = check.clone();
        async move { task.progress().await == 30.0 }
    })
    .await);
    manager.cancel(&id).await.unwrap();
}
