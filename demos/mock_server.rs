use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// Canned approval response, enough for the harness to count a success.
const APPROVAL: &[u8] = b"0210722004800000000016505050505050505050000000000001000001123456789012300";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let listener = TcpListener::bind("localhost:5005").await?;
    println!("Mock transaction server listening at localhost:5005");
    loop {
        let (mut stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            if let Ok(n) = stream.read(&mut buf).await {
                if n > 0 {
                    let _ = stream.write_all(APPROVAL).await;
                }
            }
        });
    }
}
