use std::net::SocketAddr;

use tokio::net::TcpListener;

use mcpgate::framing::{read_frame, write_frame, MAX_MCP_MESSAGE_SIZE};

/// Spawn a framed TCP backend that answers every JSON-RPC request with
/// `{"result": {"backend": <name>}}`, echoing the request ID.
#[allow(dead_code)]
pub async fn spawn_framed_backend(name: &'static str) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                while let Ok(request) =
                    read_frame(&mut stream, MAX_MCP_MESSAGE_SIZE, None).await
                {
                    let request: serde_json::Value = match serde_json::from_slice(&request) {
                        Ok(v) => v,
                        Err(_) => break,
                    };
                    let response = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "result": { "backend": name }
                    });
                    let payload = serde_json::to_vec(&response).expect("serialize response");
                    if write_frame(&mut stream, &payload, None).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, handle)
}

/// Spawn a backend that accepts connections and reads requests but never
/// replies.
#[allow(dead_code)]
pub async fn spawn_silent_backend() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            held.push(tokio::spawn(async move {
                while read_frame(&mut stream, MAX_MCP_MESSAGE_SIZE, None)
                    .await
                    .is_ok()
                {}
            }));
        }
    });

    (addr, handle)
}

/// An address in the dynamic range that nothing listens on.
#[allow(dead_code)]
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);
    addr
}
