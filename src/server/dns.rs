use std::{io, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use hickory_proto::op::Message;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
};
use tracing::{debug, error, info, warn};

use crate::gateway::Gateway;
use crate::server::shutdown_signal;
use crate::translate::Transport;

const MAX_UDP_DATAGRAM: usize = 4096;

/// Plain DNS on UDP and TCP at the same address.
pub async fn run_dns_server(addr: &str, gateway: Gateway) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid DNS listener address: {addr}"))?;

    let udp = UdpSocket::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind UDP DNS listener at {socket_addr}"))?;
    let tcp = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind TCP DNS listener at {socket_addr}"))?;

    info!(listener = %socket_addr, "Starting DNS server");
    tokio::try_join!(
        serve_udp(Arc::new(udp), gateway.clone()),
        serve_tcp(tcp, gateway),
    )?;
    Ok(())
}

pub async fn serve_udp(socket: Arc<UdpSocket>, gateway: Gateway) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut buffer = vec![0u8; MAX_UDP_DATAGRAM];
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown signal received; stopping UDP DNS server");
                break;
            }
            received = socket.recv_from(&mut buffer) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "Failed to receive DNS datagram");
                        continue;
                    }
                };
                let request = match Message::from_vec(&buffer[..len]) {
                    Ok(request) => request,
                    Err(err) => {
                        debug!(peer = %peer, error = %err, "Dropping malformed DNS datagram");
                        continue;
                    }
                };

                let socket = socket.clone();
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    let outcome = gateway.resolve(&request, Transport::Udp, Some(peer.ip())).await;
                    if let Err(err) = socket.send_to(&outcome.bytes, peer).await {
                        warn!(peer = %peer, error = %err, "Failed to send DNS reply");
                    }
                });
            }
        }
    }
    Ok(())
}

pub async fn serve_tcp(listener: TcpListener, gateway: Gateway) -> Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown signal received; stopping TCP DNS server");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(pair) => pair,
                    Err(err) => {
                        error!(error = %err, "Failed to accept DNS connection");
                        continue;
                    }
                };

                let gateway = gateway.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_tcp_connection(stream, peer, gateway).await {
                        warn!(peer = %peer, error = %err, "DNS connection terminated with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn handle_tcp_connection<S>(mut stream: S, peer: SocketAddr, gateway: Gateway) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("Failed to read DNS frame length"),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }

        let mut payload = vec![0u8; len];
        stream
            .read_exact(&mut payload)
            .await
            .context("Failed to read DNS frame payload")?;

        let request = match Message::from_vec(&payload) {
            Ok(request) => request,
            Err(err) => {
                // Ignore malformed queries.
                debug!(peer = %peer, error = %err, "Skipping malformed DNS frame");
                continue;
            }
        };

        let outcome = gateway.resolve(&request, Transport::Tcp, Some(peer.ip())).await;
        write_frame(&mut stream, &outcome.bytes).await?;
    }

    Ok(())
}

async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > u16::MAX as usize {
        anyhow::bail!("DNS message exceeds TCP frame size limit");
    }
    stream
        .write_u16(payload.len() as u16)
        .await
        .context("Failed to write DNS frame length")?;
    stream
        .write_all(payload)
        .await
        .context("Failed to write DNS frame payload")?;
    stream.flush().await.context("Failed to flush DNS frame")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use hickory_proto::op::{Edns, ResponseCode};
    use tokio::net::TcpStream;

    use crate::gateway::tests::{gateway_for, query, spawn_upstream};
    use crate::lists::DomainLists;

    const BIG_ANSWER: &str = r#"{"Status":0,"Answer":[
        {"name":"big.example.","type":16,"TTL":60,"data":"\"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\""},
        {"name":"big.example.","type":16,"TTL":60,"data":"\"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\""},
        {"name":"big.example.","type":16,"TTL":60,"data":"\"cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc\""}
    ]}"#;

    #[tokio::test]
    async fn udp_replies_are_truncated_to_the_client_buffer() {
        let (upstream, _hits) = spawn_upstream(BIG_ANSWER).await;
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(serve_udp(server, gateway_for(upstream, DomainLists::default())));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query("big.example.").to_vec().unwrap(), server_addr)
            .await
            .unwrap();
        let mut buffer = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buffer))
            .await
            .expect("reply in time")
            .unwrap();
        assert_eq!(len, 512);
        assert_eq!(buffer[2] & 0x02, 0x02);
    }

    #[tokio::test]
    async fn edns_buffer_avoids_truncation() {
        let (upstream, _hits) = spawn_upstream(BIG_ANSWER).await;
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(serve_udp(server, gateway_for(upstream, DomainLists::default())));

        let mut request = query("big.example.");
        request
            .extensions_mut()
            .get_or_insert_with(Edns::new)
            .set_max_payload(4096);
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&request.to_vec().unwrap(), server_addr).await.unwrap();
        let mut buffer = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buffer))
            .await
            .expect("reply in time")
            .unwrap();
        let reply = Message::from_vec(&buffer[..len]).unwrap();
        assert!(!reply.truncated());
        assert_eq!(reply.answers().len(), 3);
    }

    #[tokio::test]
    async fn tcp_frames_are_answered_in_full() {
        let (upstream, _hits) = spawn_upstream(BIG_ANSWER).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        tokio::spawn(serve_tcp(listener, gateway_for(upstream, DomainLists::default())));

        let mut stream = TcpStream::connect(server_addr).await.unwrap();
        write_frame(&mut stream, &query("big.example.").to_vec().unwrap())
            .await
            .unwrap();
        let len = stream.read_u16().await.unwrap() as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();

        let reply = Message::from_vec(&payload).unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(!reply.truncated());
        assert_eq!(reply.answers().len(), 3);
    }
}
