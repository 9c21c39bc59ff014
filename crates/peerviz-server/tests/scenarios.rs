use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use peerviz_core::{GraphModel, NO_GROUP_SENTINEL, Rgba};
use peerviz_reporter::{Event, Reporter};
use peerviz_server::{AggregationServer, ServerConfig, ServerHandle};

const WAIT: Duration = Duration::from_secs(5);

async fn start() -> (SocketAddr, ServerHandle, JoinHandle<()>) {
    let server = AggregationServer::open(&ServerConfig::loopback())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let run = tokio::spawn(server.run());
    (addr, handle, run)
}

/// Events on one connection apply in order, so once the marker attribute
/// is visible everything sent before it has been applied.
async fn sync(stream: &mut TcpStream, model: &GraphModel, id: &str) {
    stream
        .write_all(format!("CTM{id},sync,1,1;").as_bytes())
        .await
        .unwrap();
    timeout(WAIT, async {
        while model.attribute(id, "sync").await.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("events should be applied");
}

#[tokio::test]
async fn join_and_communicate_then_drain() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();
    let mut conn = TcpStream::connect(addr).await.unwrap();

    conn.write_all(b"CON1,alpha;").await.unwrap();
    conn.write_all(b"CON2,alpha;").await.unwrap();
    conn.write_all(b"COM1,2,alpha;").await.unwrap();
    sync(&mut conn, &model, "2").await;

    let first = model.snapshot().await;
    let alpha = first.group("alpha").unwrap();
    assert_eq!(alpha.vertices.len(), 2);
    assert_eq!(alpha.edge_ids(), vec![("1", "2")]);

    let second = model.snapshot().await;
    let alpha = second.group("alpha").unwrap();
    assert_eq!(alpha.vertices.len(), 2);
    assert!(alpha.edges.is_empty());

    handle.close();
}

#[tokio::test]
async fn progress_report_sets_attribute_and_color() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();
    let mut conn = TcpStream::connect(addr).await.unwrap();

    conn.write_all(b"CON1,alpha;CTM1,msgs,5,10;").await.unwrap();
    sync(&mut conn, &model, "marker").await;

    assert_eq!(model.attribute("1", "msgs").await.as_deref(), Some("5/10"));
    let snap = model.snapshot().await;
    let vertex = snap.group("alpha").unwrap().vertex("1").unwrap();
    assert_eq!(vertex.color, Some(Rgba::completion(0.5)));
    assert_eq!(vertex.label, "id: 1, msgs: 5/10");

    handle.close();
}

#[tokio::test]
async fn sentinel_group_never_appears() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();
    let mut conn = TcpStream::connect(addr).await.unwrap();

    let noise = format!("CON1,{NO_GROUP_SENTINEL};COM1,2,{NO_GROUP_SENTINEL};").repeat(5);
    conn.write_all(noise.as_bytes()).await.unwrap();
    conn.write_all(b"CON1,alpha;").await.unwrap();
    sync(&mut conn, &model, "1").await;

    let snap = model.snapshot().await;
    assert!(snap.group(NO_GROUP_SENTINEL).is_none());
    assert_eq!(model.group_names().await, vec!["alpha"]);

    handle.close();
}

#[tokio::test]
async fn malformed_events_are_dropped_and_stream_continues() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();
    let mut conn = TcpStream::connect(addr).await.unwrap();

    conn.write_all(b"XYZ1;CON1;CTM1,msgs,5,0;CTM1,msgs,x,2;CON1,alpha;")
        .await
        .unwrap();
    sync(&mut conn, &model, "1").await;

    let snap = model.snapshot().await;
    assert_eq!(snap.group("alpha").unwrap().vertices.len(), 1);
    assert_eq!(model.attribute("1", "msgs").await, None);

    handle.close();
}

// The original reader lost events split across TCP segments; they must
// be reassembled instead.
#[tokio::test]
async fn event_split_across_segments_is_reassembled() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.set_nodelay(true).unwrap();

    conn.write_all(b"CON1,al").await.unwrap();
    conn.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.write_all(b"pha;").await.unwrap();
    sync(&mut conn, &model, "1").await;

    assert_eq!(model.group_names().await, vec!["alpha"]);
    handle.close();
}

#[tokio::test]
async fn reset_connection_does_not_disturb_others() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();

    let mut broken = TcpStream::connect(addr).await.unwrap();
    broken.write_all(b"CON1,alpha;").await.unwrap();
    sync(&mut broken, &model, "1").await;
    // Unterminated frame, then an abortive close (RST) instead of FIN.
    broken.write_all(b"CON9,gam").await.unwrap();
    broken.flush().await.unwrap();
    #[allow(deprecated)]
    broken.set_linger(Some(Duration::ZERO)).unwrap();
    drop(broken);

    let mut healthy = TcpStream::connect(addr).await.unwrap();
    healthy
        .write_all(b"CON2,alpha;COM2,1,alpha;")
        .await
        .unwrap();
    sync(&mut healthy, &model, "2").await;

    assert!(handle.is_open());
    let snap = model.snapshot().await;
    let alpha = snap.group("alpha").unwrap();
    assert_eq!(alpha.edge_ids(), vec![("2", "1")]);
    assert!(alpha.vertex("9").is_none());
    assert_eq!(model.group_names().await, vec!["alpha"]);
    assert_eq!(model.attribute("9", "id").await, None);

    handle.close();
}

#[tokio::test]
async fn duplicate_joins_from_many_connections_are_idempotent() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();

    let mut conns = Vec::new();
    for _ in 0..4 {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"CON1,alpha;CON2,alpha;CON3,alpha;COM3,1,alpha;")
            .await
            .unwrap();
        conns.push(conn);
    }
    for (i, conn) in conns.iter_mut().enumerate() {
        sync(conn, &model, &format!("sync{i}")).await;
    }

    let snap = model.snapshot().await;
    let alpha = snap.group("alpha").unwrap();
    // Three participants plus the four sync markers.
    assert_eq!(alpha.vertices.len(), 7);
    assert_eq!(alpha.edges.len(), 4);

    handle.close();
}

#[tokio::test]
async fn late_group_catches_up_known_nodes() {
    let (addr, handle, _run) = start().await;
    let model = handle.model();
    let mut conn = TcpStream::connect(addr).await.unwrap();

    conn.write_all(b"CON1,alpha;CON2,beta;COM1,2,beta;").await.unwrap();
    sync(&mut conn, &model, "2").await;

    let snap = model.snapshot().await;
    let beta = snap.group("beta").unwrap();
    assert!(beta.vertex("1").is_some());
    assert_eq!(beta.edge_ids(), vec![("1", "2")]);

    handle.close();
}

#[tokio::test]
async fn end_barrier_releases_both_participants_once() {
    let (addr, handle, run) = start().await;
    let model = handle.model();

    let mut one = Reporter::new(addr.to_string());
    let mut two = Reporter::new(addr.to_string());
    one.report(&Event::connect("1", "alpha")).await.unwrap();
    two.report(&Event::connect("2", "alpha")).await.unwrap();
    timeout(WAIT, async {
        while handle.barrier().known_count().await < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let first = tokio::spawn(async move {
        one.report(&Event::end("1")).await.unwrap();
        one
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!first.is_finished(), "first participant must wait for the second");
    assert!(handle.is_open());
    assert_eq!(handle.teardown_count(), 0);

    timeout(WAIT, two.report(&Event::end("2")))
        .await
        .unwrap()
        .unwrap();
    let one = timeout(WAIT, first).await.unwrap().unwrap();
    assert!(one.is_closed());
    assert!(two.is_closed());

    timeout(WAIT, run).await.expect("server should stop").unwrap();
    assert_eq!(handle.teardown_count(), 1);
    assert!(!handle.is_open());
    assert_eq!(model.group_names().await, vec!["alpha"]);
}

#[tokio::test]
async fn raw_end_connection_receives_ok_and_eof() {
    let (addr, handle, run) = start().await;
    let mut conn = TcpStream::connect(addr).await.unwrap();

    conn.write_all(b"CON7,alpha;END7;").await.unwrap();
    let mut reply = Vec::new();
    timeout(WAIT, conn.read_to_end(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply, b"OK");

    timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(handle.teardown_count(), 1);
}

#[tokio::test]
async fn close_while_waiting_at_barrier_drops_without_ack() {
    let (addr, handle, run) = start().await;
    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"CON1,alpha;CON2,alpha;END1;").await.unwrap();

    timeout(WAIT, async {
        while handle.barrier().ended_count().await < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    handle.close();

    let mut reply = Vec::new();
    timeout(WAIT, conn.read_to_end(&mut reply)).await.unwrap().unwrap();
    assert!(reply.is_empty());
    timeout(WAIT, run).await.unwrap().unwrap();
    assert_eq!(handle.teardown_count(), 0);
}

#[tokio::test]
async fn snapshots_are_consistent_under_concurrent_traffic() {
    let (addr, handle, _run) = start().await;
    let model: Arc<GraphModel> = handle.model();

    let mut writers = Vec::new();
    for w in 0..4 {
        writers.push(tokio::spawn(async move {
            let mut reporter = Reporter::new(addr.to_string());
            reporter.report(&Event::connect(format!("n{w}"), "alpha")).await.unwrap();
            for _ in 0..25 {
                reporter
                    .report(&Event::communicate(format!("n{w}"), "hub", "alpha"))
                    .await
                    .unwrap();
            }
            reporter
                .report(&Event::progress(format!("n{w}"), "done", 1.0, 1.0))
                .await
                .unwrap();
            reporter
        }));
    }

    let mut edges = 0;
    let mut reporters = Vec::new();
    for w in writers {
        reporters.push(w.await.unwrap());
        edges += model.snapshot().await.edge_count();
    }
    timeout(WAIT, async {
        loop {
            let mut done = 0;
            for w in 0..4 {
                if model.attribute(&format!("n{w}"), "done").await.is_some() {
                    done += 1;
                }
            }
            if done == 4 {
                break;
            }
            edges += model.snapshot().await.edge_count();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    edges += model.snapshot().await.edge_count();

    assert_eq!(edges, 100);
    drop(reporters);
    handle.close();
}
