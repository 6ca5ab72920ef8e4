use anyhow::Result;
use cloudsync::client;
use cloudsync::config::ClientConfig;
use cloudsync::logger::NoopLogger;
use cloudsync::operation::Operation;
use cloudsync::server;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn write_file(path: &Path, size: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..250u32 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    panic!("timed out waiting for {what}");
}

fn same_content(a: &Path, b: &Path) -> bool {
    matches!((std::fs::read(a), std::fs::read(b)), (Ok(x), Ok(y)) if x == y)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_sync_then_live_changes() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let cli_tmp = tempfile::tempdir()?;
    let srv = srv_tmp.path().canonicalize()?;
    let local = cli_tmp.path().canonicalize()?;

    // Server already holds a copy of a.txt elsewhere plus a file the client lacks
    write_file(&srv.join("alice/old/a.txt"), 3000)?;
    write_file(&srv.join("alice/stale.txt"), 10)?;

    write_file(&local.join("a.txt"), 3000)?;
    write_file(&local.join("dir1/b.bin"), 300_000)?;
    std::fs::create_dir_all(local.join("empty"))?;

    // Real server on an ephemeral port
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let srv_root = srv.clone();
    let server_task = tokio::spawn(async move {
        let _ = server::serve_listener(listener, &srv_root, Arc::new(NoopLogger)).await;
    });

    let cfg = ClientConfig {
        server: addr.to_string(),
        username: "alice".into(),
        root: local.clone(),
        debounce: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(100),
        chunk_size: 64 * 1024,
        log_file: None,
        print_tree: false,
    };
    let client_task = tokio::spawn(client::run(cfg, Arc::new(NoopLogger)));

    let user = srv.join("alice");
    wait_until("initial sync", || {
        same_content(&local.join("a.txt"), &user.join("a.txt"))
            && same_content(&local.join("dir1/b.bin"), &user.join("dir1/b.bin"))
            && user.join("empty").is_dir()
            && !user.join("stale.txt").exists()
            && !user.join("old/a.txt").exists()
    })
    .await;

    // Deleted files went to the recycle bin, not away
    let recycled = std::fs::read_dir(srv.join("$recycled/alice"))?.count();
    assert_eq!(recycled, 2);

    // A second login for the same user is refused while the client is online
    let mut dup = client::connect(&addr.to_string()).await?;
    let err = client::login(&mut dup, "alice").await.unwrap_err();
    assert!(format!("{err:#}").contains("Already logged in"));
    drop(dup);

    // Live changes
    write_file(&local.join("live/new.txt"), 5000)?;
    wait_until("live create", || {
        same_content(&local.join("live/new.txt"), &user.join("live/new.txt"))
    })
    .await;

    std::fs::rename(local.join("a.txt"), local.join("renamed.txt"))?;
    wait_until("live rename", || {
        user.join("renamed.txt").is_file() && !user.join("a.txt").exists()
    })
    .await;

    std::fs::write(local.join("dir1/b.bin"), b"rewritten")?;
    wait_until("live modify", || {
        std::fs::read(user.join("dir1/b.bin")).map(|b| b == b"rewritten").unwrap_or(false)
    })
    .await;

    client_task.abort();
    server_task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_reconnects_after_connection_loss() -> Result<()> {
    use cloudsync::codec::{read_message, write_message};
    use cloudsync::operation::{EntityKind, Message};

    let srv_tmp = tempfile::tempdir()?;
    let cli_tmp = tempfile::tempdir()?;
    let srv = srv_tmp.path().canonicalize()?;
    let local = cli_tmp.path().canonicalize()?;
    write_file(&local.join("one.txt"), 100)?;

    // First peer: a bare listener that accepts the login, takes the initial
    // upload and then hangs up.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let cfg = ClientConfig {
        server: addr.to_string(),
        username: "bob".into(),
        root: local.clone(),
        debounce: Duration::from_millis(50),
        reconnect_delay: Duration::from_millis(100),
        chunk_size: 4096,
        log_file: None,
        print_tree: false,
    };
    let client_task = tokio::spawn(client::run(cfg, Arc::new(NoopLogger)));

    let (mut s, _) = listener.accept().await?;
    let first = read_message(&mut s).await?.expect("login");
    assert_eq!(first.operation(), &Operation::AuthRequest { username: "bob".into() });
    let ok = Operation::AuthSuccess {
        username: "bob".into(),
        inventory: Vec::new(),
    };
    write_message(&mut s, &Message::new(ok)?).await?;
    let upload = read_message(&mut s).await?.expect("initial upload");
    assert_eq!(upload.operation(), &Operation::create(EntityKind::File, "bob/one.txt"));
    drop(s);
    drop(listener);

    // Changed while disconnected: picked up by the next snapshot
    write_file(&local.join("two.txt"), 200)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let srv_root = srv.clone();
    let server_task = tokio::spawn(async move {
        let _ = server::serve_listener(listener, &srv_root, Arc::new(NoopLogger)).await;
    });

    let user = srv.join("bob");
    wait_until("sync after reconnect", || {
        same_content(&local.join("one.txt"), &user.join("one.txt"))
            && same_content(&local.join("two.txt"), &user.join("two.txt"))
    })
    .await;

    client_task.abort();
    server_task.abort();
    Ok(())
}

#[tokio::test]
async fn wrong_first_message_closes_connection() -> Result<()> {
    let srv_tmp = tempfile::tempdir()?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let root = srv_tmp.path().to_path_buf();
    tokio::spawn(async move {
        let _ = server::serve_listener(listener, &root, Arc::new(NoopLogger)).await;
    });

    let mut s = client::connect(&addr.to_string()).await?;
    let op = Operation::create(cloudsync::operation::EntityKind::Directory, "x");
    cloudsync::codec::write_message(&mut s, &cloudsync::operation::Message::new(op)?).await?;
    let reply = cloudsync::codec::read_message(&mut s).await;
    assert!(matches!(reply, Ok(None) | Err(_)));
    Ok(())
}
