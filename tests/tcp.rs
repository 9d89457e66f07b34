use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use sockline::{hooks, Connection, ConnectionState, Error, Options};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

async fn listener() -> (TcpListener, String) {
    let _ = tracing_subscriber::fmt::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Read one request head from the stream.
async fn read_head(stream: &mut BufReader<TcpStream>) -> String {
    let mut head = String::new();
    loop {
        let n = stream.read_line(&mut head).await.unwrap();
        if n == 0 || head.ends_with("\r\n\r\n") {
            return head;
        }
    }
}

#[tokio::test]
async fn exchange_over_tcp() -> Result<(), BoxError> {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        let head = read_head(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nover tcp")
            .await
            .unwrap();
        stream.shutdown().await.unwrap();
        head
    });

    let mut conn = Connection::new(Options::new(url.as_str()));
    conn.on_header_received()
        .register("parse-head", hooks::parse_head());

    let response = conn
        .send("GET /hello HTTP/1.1\r\nhost: local\r\n\r\n")
        .await?;
    assert_eq!(response.status(), Some(StatusCode::OK));
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.body().unwrap().as_ref(), b"over tcp");

    assert_eq!(server.await?, "GET /hello HTTP/1.1\r\nhost: local\r\n\r\n");
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    Ok(())
}

#[tokio::test]
async fn persistent_connection_survives_until_peer_closes() -> Result<(), BoxError> {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let mut accepted = 0;
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            accepted += 1;
            let mut stream = BufReader::new(stream);
            read_head(&mut stream).await;
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\nok").await.unwrap();
            stream.shutdown().await.unwrap();

            // Wait for the client to go away.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        }
        accepted
    });

    let mut conn = Connection::new(Options::new(url.as_str()).with_persist(true));

    let first = conn.send("GET /one HTTP/1.1\r\n\r\n").await?;
    assert_eq!(first.body().unwrap().as_ref(), b"ok");
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(!conn.is_connected(), "peer closed the stream");

    // The dead session is replaced on the next send.
    let second = conn.send("GET /two HTTP/1.1\r\n\r\n").await?;
    assert_eq!(second.body().unwrap().as_ref(), b"ok");

    conn.close().await?;
    assert_eq!(server.await?, 2);
    Ok(())
}

#[tokio::test]
async fn read_timeout_over_tcp() -> Result<(), BoxError> {
    let (listener, url) = listener().await;

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        read_head(&mut stream).await;
        // Hold the connection open without answering.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut options = Options::new(url.as_str());
    options.timeout = Duration::from_millis(100);
    let mut conn = Connection::new(options);

    let err = conn.send("GET / HTTP/1.1\r\n\r\n").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(!conn.is_connected());

    server.abort();
    let _ = server.await;
    Ok(())
}

#[tokio::test]
async fn connect_refused() -> Result<(), BoxError> {
    let (listener, url) = listener().await;
    drop(listener);

    let mut conn = Connection::new(Options::new(url.as_str()));
    let err = conn.send("GET / HTTP/1.1\r\n\r\n").await.unwrap_err();
    assert!(err.is_connect());
    match err {
        Error::Connect(error) => assert!(!error.is_invalid_url()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    Ok(())
}

#[tokio::test]
async fn missing_server_url() -> Result<(), BoxError> {
    let mut conn = Connection::new(Options::default());
    let err = conn.connect().await.unwrap_err();
    match err {
        Error::Connect(error) => {
            assert!(error.is_invalid_url());
            assert!(error.to_string().starts_with("server url is mandatory"));
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}
