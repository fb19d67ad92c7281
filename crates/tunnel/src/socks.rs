//! Connection-oriented outbound proxy
//!
//! Implements the SOCKS5 handshake for the CONNECT command with no
//! authentication, brokering outbound traffic from the remote workload
//! back to cluster-internal services. Each accepted connection gets its
//! own task pair and shares nothing; backpressure is plain TCP flow
//! control.

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Default listen port of the sidecar proxy.
pub const DEFAULT_PROXY_PORT: u16 = 1080;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

const FORWARD_CHUNK: usize = 4096;

/// A parsed CONNECT target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    /// Host name or dotted IPv4 address
    pub host: String,
    /// Target port
    pub port: u16,
}

/// Accept and serve proxy connections until the listener fails.
pub async fn serve(listener: TcpListener) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Modal operator proxy listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream).await {
                debug!(error = %e, %peer, "Proxy connection ended");
            }
        });
    }
}

async fn handle_client(mut client: TcpStream) -> anyhow::Result<()> {
    let target = match negotiate(&mut client).await? {
        Some(target) => target,
        None => return Ok(()),
    };

    debug!(host = %target.host, port = target.port, "Connecting to target");
    let upstream = match TcpStream::connect((target.host.as_str(), target.port)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            client.write_all(&reply(REPLY_CONNECTION_REFUSED)).await?;
            bail!("connect to {}:{} failed: {}", target.host, target.port, e);
        }
    };
    client.write_all(&reply(REPLY_SUCCEEDED)).await?;

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();
    tokio::join!(
        copy_chunks(client_read, upstream_write),
        copy_chunks(upstream_read, client_write),
    );
    Ok(())
}

/// Run the greeting and request phases. Returns `None` when the
/// connection was refused (no acceptable auth method or unsupported
/// address type); the refusal reply has already been written.
pub(crate) async fn negotiate<S>(stream: &mut S) -> anyhow::Result<Option<Target>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        bail!("unsupported socks version {:#04x}", greeting[0]);
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS])
            .await?;
        return Ok(None);
    }
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION || request[1] != CMD_CONNECT {
        bail!(
            "unsupported request: version {:#04x} command {:#04x}",
            request[0],
            request[1]
        );
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)?
        }
        _ => {
            stream.write_all(&reply(REPLY_ATYP_NOT_SUPPORTED)).await?;
            return Ok(None);
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Some(Target {
        host,
        port: u16::from_be_bytes(port),
    }))
}

fn reply(code: u8) -> [u8; 10] {
    [
        SOCKS_VERSION,
        code,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ]
}

async fn copy_chunks<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; FORWARD_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn greeting_and_domain_connect() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        // CONNECT mysql.default:3306
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0d];
        request.extend_from_slice(b"mysql.default");
        request.extend_from_slice(&3306u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = negotiation.await.unwrap().unwrap().unwrap();
        assert_eq!(
            target,
            Target {
                host: "mysql.default".to_owned(),
                port: 3306
            }
        );
    }

    #[tokio::test]
    async fn ipv4_address_type() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 7, 0x1f, 0x90])
            .await
            .unwrap();

        let target = negotiation.await.unwrap().unwrap().unwrap();
        assert_eq!(target.host, "10.0.0.7");
        assert_eq!(target.port, 8080);
    }

    #[tokio::test]
    async fn refuses_without_no_auth_method() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        // Only username/password (0x02) on offer.
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut refusal = [0u8; 2];
        client.read_exact(&mut refusal).await.unwrap();
        assert_eq!(refusal, [0x05, 0xff]);
        assert!(negotiation.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_ipv6_address_type() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x04])
            .await
            .unwrap();

        let mut refusal = [0u8; 10];
        client.read_exact(&mut refusal).await.unwrap();
        assert_eq!(refusal, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        assert!(negotiation.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn proxies_bytes_end_to_end() {
        // Upstream echo service.
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = serve(listener).await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let host = b"127.0.0.1";
        let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
        request.extend_from_slice(host);
        request.extend_from_slice(&echo_port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], 0x00);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }
}
