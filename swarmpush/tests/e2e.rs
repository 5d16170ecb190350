use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use swarmpush::{Config, CreateTask, Node, Role, TaskState, TaskStatus};
use swarmpush::config::{AuthConfig, NetConfig};
use tokio::time::{sleep, timeout};

const USERNAME: &str = "fleet";
const PASSWORD: &str = "push-it";
const SUCCESS_DEADLINE: Duration = Duration::from_secs(60);

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn node_config(name: &str, downloads: Option<&Path>) -> Config {
    Config {
        name: name.into(),
        net: NetConfig {
            ip: "127.0.0.1".into(),
            mgnt_port: free_port(),
            data_port: free_port(),
            tls: None,
        },
        auth: AuthConfig {
            username: USERNAME.into(),
            password: PASSWORD.into(),
        },
        log: None,
        downloads_dir: downloads.map(|p| p.to_path_buf()),
        block_size: 16 * 1024,
        request_pipeline_depth: 16,
        max_active_pieces_per_peer: 4,
    }
}

fn api(addr: SocketAddr, tail: &str) -> String {
    format!("http://{addr}/api/v1/{tail}")
}

async fn query_status(client: &reqwest::Client, addr: SocketAddr, id: &str) -> Option<TaskStatus> {
    let resp = client
        .get(api(addr, &format!("server/tasks/{id}")))
        .basic_auth(USERNAME, Some(PASSWORD))
        .send()
        .await
        .unwrap();
    if resp.status() == reqwest::StatusCode::OK {
        Some(resp.json().await.unwrap())
    } else {
        None
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn fleet_distribution_end_to_end() {
    let src = tempfile::tempdir().unwrap();
    let dl_one = tempfile::tempdir().unwrap();
    let dl_two = tempfile::tempdir().unwrap();

    // 2.5 MiB across two files so pieces straddle a file boundary
    let payload_a: Vec<u8> = (0u8..=255).cycle().take(2 * 1024 * 1024 + 300).collect();
    let payload_b = vec![0x5Au8; 512 * 1024];
    let file_a = src.path().join("release/app.bin");
    let file_b = src.path().join("release/config.dat");
    std::fs::create_dir_all(src.path().join("release")).unwrap();
    std::fs::write(&file_a, &payload_a).unwrap();
    std::fs::write(&file_b, &payload_b).unwrap();

    let server = Node::start(node_config("srv", None), Role::Server)
        .await
        .unwrap();
    let agent_one = Node::start(node_config("a1", Some(dl_one.path())), Role::Agent)
        .await
        .unwrap();
    let agent_two = Node::start(node_config("a2", Some(dl_two.path())), Role::Agent)
        .await
        .unwrap();

    let client = reqwest::Client::new();
    let create = CreateTask {
        id: "release-42".into(),
        dispatch_files: vec![
            file_a.to_string_lossy().into_owned(),
            file_b.to_string_lossy().into_owned(),
        ],
        dest_ips: vec![
            agent_one.mgnt_addr().to_string(),
            agent_two.mgnt_addr().to_string(),
        ],
        timeout_secs: None,
    };

    let resp = client
        .post(api(server.mgnt_addr(), "server/tasks"))
        .basic_auth(USERNAME, Some(PASSWORD))
        .json(&create)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    // identical resubmission is acknowledged without new work
    let resp = client
        .post(api(server.mgnt_addr(), "server/tasks"))
        .basic_auth(USERNAME, Some(PASSWORD))
        .json(&create)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

    // same id with different content is refused
    let mut conflicting = create.clone();
    conflicting.dest_ips.pop();
    let resp = client
        .post(api(server.mgnt_addr(), "server/tasks"))
        .basic_auth(USERNAME, Some(PASSWORD))
        .json(&conflicting)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let status = timeout(SUCCESS_DEADLINE, async {
        loop {
            if let Some(status) = query_status(&client, server.mgnt_addr(), "release-42").await {
                assert_ne!(status.state, TaskState::Failed, "task failed: {:?}", status.error);
                if status.state == TaskState::Succeeded {
                    return status;
                }
            }
            sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("distribution did not finish in time");

    assert_eq!(status.dests.len(), 2);
    for dest in status.dests.values() {
        assert!(dest.dispatched && dest.started && dest.finished && !dest.failed);
        assert_eq!(dest.percent, 100.0);
    }

    for downloads in [dl_one.path(), dl_two.path()] {
        let mirrored_a =
            downloads.join(file_a.to_string_lossy().trim_start_matches('/'));
        let mirrored_b =
            downloads.join(file_b.to_string_lossy().trim_start_matches('/'));
        assert_eq!(std::fs::read(mirrored_a).unwrap(), payload_a);
        assert_eq!(std::fs::read(mirrored_b).unwrap(), payload_b);
    }

    // terminal tasks stay queryable until the operator removes them
    let resp = client
        .delete(api(server.mgnt_addr(), "server/tasks/release-42"))
        .basic_auth(USERNAME, Some(PASSWORD))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    assert!(query_status(&client, server.mgnt_addr(), "release-42")
        .await
        .is_none());

    server.stop().await;
    agent_one.stop().await;
    agent_two.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn management_api_requires_credentials() {
    let server = Node::start(node_config("srv", None), Role::Server)
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .get(api(server.mgnt_addr(), "server/tasks/whatever"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let resp = client
        .get(api(server.mgnt_addr(), "server/tasks/whatever"))
        .basic_auth(USERNAME, Some("wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    // correct credentials reach the handler (unknown task, but authorized)
    let resp = client
        .get(api(server.mgnt_addr(), "server/tasks/whatever"))
        .basic_auth(USERNAME, Some(PASSWORD))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_task_operations_are_refused() {
    let server = Node::start(node_config("srv", None), Role::Server)
        .await
        .unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .delete(api(server.mgnt_addr(), "server/tasks/nope"))
        .basic_auth(USERNAME, Some(PASSWORD))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let dl = tempfile::tempdir().unwrap();
    let agent = Node::start(node_config("a1", Some(dl.path())), Role::Agent)
        .await
        .unwrap();
    let resp = client
        .delete(api(agent.mgnt_addr(), "agent/tasks/nope"))
        .basic_auth(USERNAME, Some(PASSWORD))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    server.stop().await;
    agent.stop().await;
}
