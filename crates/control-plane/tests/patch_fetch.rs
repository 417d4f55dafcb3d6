use control_plane::{error::Error, services::patches::{HttpPatchSource, PatchSource}};
use std::time::{Duration, Instant};
use tokio::{io::AsyncWriteExt, net::TcpListener};

#[tokio::test]
async fn silent_server_times_out_as_fetch_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // accept and never answer
    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await { held.push(sock); }
    });
    let source = HttpPatchSource::new(Duration::from_millis(300), 1024).unwrap();
    let started = Instant::now();
    let err = source.fetch(&format!("http://{addr}/fix.patch")).await.unwrap_err();
    assert!(matches!(err, Error::Fetch { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    server.abort();
}

#[tokio::test]
async fn body_is_returned_and_error_status_is_a_fetch_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        for reply in [
            "HTTP/1.1 200 OK\r\ncontent-length: 12\r\nconnection: close\r\n\r\n--- diff ---",
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        ] {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
            let _ = sock.write_all(reply.as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    let source = HttpPatchSource::new(Duration::from_secs(5), 1024).unwrap();
    assert_eq!(source.fetch(&format!("http://{addr}/ok.patch")).await.unwrap(), "--- diff ---");
    let err = source.fetch(&format!("http://{addr}/missing.patch")).await.unwrap_err();
    assert!(matches!(err, Error::Fetch { ref reason, .. } if reason.contains("404")));
    server.abort();
}

#[tokio::test]
async fn oversized_body_is_a_fetch_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = "+".repeat(64);
    let server = tokio::spawn(async move {
        // declared length first, then a body that only ends at close
        for head in ["HTTP/1.1 200 OK\r\ncontent-length: 64\r\nconnection: close\r\n\r\n", "HTTP/1.1 200 OK\r\nconnection: close\r\n\r\n"] {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut sock, &mut buf).await;
            let _ = sock.write_all(format!("{head}{body}").as_bytes()).await;
            let _ = sock.shutdown().await;
        }
    });
    let source = HttpPatchSource::new(Duration::from_secs(5), 16).unwrap();
    for path in ["declared.patch", "streamed.patch"] {
        let err = source.fetch(&format!("http://{addr}/{path}")).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { ref reason, .. } if reason.contains("exceeds 16 bytes")), "{path}: {err:?}");
    }
    server.abort();
}
