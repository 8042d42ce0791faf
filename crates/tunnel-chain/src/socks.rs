//! SOCKS5 client (RFC 1928 / RFC 1929) used to reach a first hop through a proxy.

use std::net::{Ipv4Addr, Ipv6Addr};

use delivery_spec::{DeliveryError, DeliveryResult, SocksProxy};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::session::JoinedStream;

pub const SOCKS_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const SOCKS_USER_ENV: &str = "DELIVER_SOCKS_USER";
pub const SOCKS_PASSWORD_ENV: &str = "DELIVER_SOCKS_PASSWORD";

const SOCKS5_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Opens a TCP connection to `host:port` through `proxy`, bounded by `connect_timeout`.
pub async fn connect(
    proxy: &SocksProxy,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> DeliveryResult<TcpStream> {
    let attempt = async {
        let mut stream = TcpStream::connect(proxy.addr()).await.map_err(|err| {
            DeliveryError::connection(format!(
                "failed to reach socks proxy {}: {err}",
                proxy.addr()
            ))
        })?;
        handshake(&mut stream, proxy, host, port).await?;
        Ok(stream)
    };
    match timeout(connect_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(DeliveryError::connection(format!(
            "socks proxy {} timed out after {}s connecting to {host}:{port}",
            proxy.addr(),
            connect_timeout.as_secs()
        ))),
    }
}

/// Connects through `proxy` and relays our stdin/stdout over the socket. Used as an
/// ssh `ProxyCommand`.
pub async fn relay_stdio(proxy: &SocksProxy, host: &str, port: u16) -> DeliveryResult<()> {
    let mut stdio = JoinedStream::new(tokio::io::stdin(), tokio::io::stdout(), ());
    relay(proxy, host, port, &mut stdio).await
}

/// Relays `local` to `host:port` through `proxy` until both directions are done.
pub async fn relay<S>(
    proxy: &SocksProxy,
    host: &str,
    port: u16,
    local: &mut S,
) -> DeliveryResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = connect(proxy, host, port, SOCKS_CONNECT_TIMEOUT).await?;
    tokio::io::copy_bidirectional(local, &mut stream)
        .await
        .map_err(|err| DeliveryError::connection(format!("socks relay failed: {err}")))?;
    Ok(())
}

pub async fn handshake<S>(
    stream: &mut S,
    proxy: &SocksProxy,
    host: &str,
    port: u16,
) -> DeliveryResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if proxy.user.is_some() {
        &[SOCKS5_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]
    };
    stream
        .write_all(greeting)
        .await
        .map_err(|err| socks_io("send greeting", err))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|err| socks_io("read greeting response", err))?;
    if response[0] != SOCKS5_VERSION {
        return Err(DeliveryError::connection(format!(
            "invalid socks version in response: {}",
            response[0]
        )));
    }
    match response[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => authenticate(stream, proxy).await?,
        METHOD_NO_ACCEPTABLE => {
            return Err(DeliveryError::connection(
                "socks proxy accepted none of the offered auth methods",
            ))
        }
        other => {
            return Err(DeliveryError::connection(format!(
                "socks proxy requires unsupported auth method {other}"
            )))
        }
    }

    stream
        .write_all(&connect_request(host, port)?)
        .await
        .map_err(|err| socks_io("send connect request", err))?;

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|err| socks_io("read connect response", err))?;
    if header[1] != 0x00 {
        return Err(DeliveryError::connection(format!(
            "socks connect to {host}:{port} failed: {}",
            reply_message(header[1])
        )));
    }
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|err| socks_io("read bound address", err))?;
            len[0] as usize
        }
        other => {
            return Err(DeliveryError::connection(format!(
                "socks proxy replied with unknown address type {other}"
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut bound)
        .await
        .map_err(|err| socks_io("read bound address", err))?;
    Ok(())
}

async fn authenticate<S>(stream: &mut S, proxy: &SocksProxy) -> DeliveryResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = proxy.user.as_deref().unwrap_or("");
    let password = proxy.password.as_deref().unwrap_or("");
    if user.len() > 255 || password.len() > 255 {
        return Err(DeliveryError::connection(
            "socks credentials longer than 255 bytes",
        ));
    }
    let mut request = Vec::with_capacity(3 + user.len() + password.len());
    request.push(0x01);
    request.push(user.len() as u8);
    request.extend_from_slice(user.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(|err| socks_io("send credentials", err))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|err| socks_io("read auth response", err))?;
    if response[1] != 0x00 {
        return Err(DeliveryError::connection("socks authentication failed"));
    }
    Ok(())
}

fn connect_request(host: &str, port: u16) -> DeliveryResult<Vec<u8>> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        request.push(ATYP_IPV4);
        request.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        request.push(ATYP_IPV6);
        request.extend_from_slice(&ip.octets());
    } else {
        if host.is_empty() || host.len() > 255 {
            return Err(DeliveryError::connection(format!(
                "invalid host for socks connect: {host:?}"
            )));
        }
        request.push(ATYP_DOMAIN);
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general socks server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "ttl expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown socks error",
    }
}

fn socks_io(step: &str, err: std::io::Error) -> DeliveryError {
    DeliveryError::connection(format!("socks proxy: failed to {step}: {err}"))
}

pub fn parse_host_port(addr: &str) -> DeliveryResult<(String, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        DeliveryError::config(format!("invalid address {addr}, expected host:port"))
    })?;
    let port = port
        .parse::<u16>()
        .map_err(|_| DeliveryError::config(format!("invalid port in address {addr}")))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct FakeProxy {
        require_auth: Option<(&'static str, &'static str)>,
        reply: u8,
    }

    /// Serves one client: negotiates, checks the CONNECT target, then echoes bytes.
    async fn spawn_fake_proxy(fake: FakeProxy) -> (SocksProxy, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 2];
            stream.read_exact(&mut header).await.unwrap();
            let mut methods = vec![0u8; header[1] as usize];
            stream.read_exact(&mut methods).await.unwrap();
            if let Some((user, password)) = fake.require_auth {
                assert!(methods.contains(&METHOD_USER_PASS));
                stream.write_all(&[0x05, METHOD_USER_PASS]).await.unwrap();
                let mut version_len = [0u8; 2];
                stream.read_exact(&mut version_len).await.unwrap();
                let mut got_user = vec![0u8; version_len[1] as usize];
                stream.read_exact(&mut got_user).await.unwrap();
                let mut pass_len = [0u8; 1];
                stream.read_exact(&mut pass_len).await.unwrap();
                let mut got_pass = vec![0u8; pass_len[0] as usize];
                stream.read_exact(&mut got_pass).await.unwrap();
                let ok = got_user == user.as_bytes() && got_pass == password.as_bytes();
                stream
                    .write_all(&[0x01, if ok { 0x00 } else { 0x01 }])
                    .await
                    .unwrap();
                if !ok {
                    return String::new();
                }
            } else {
                stream.write_all(&[0x05, METHOD_NO_AUTH]).await.unwrap();
            }
            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request[3], ATYP_DOMAIN);
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.unwrap();
            let mut host = vec![0u8; len[0] as usize];
            stream.read_exact(&mut host).await.unwrap();
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await.unwrap();
            let target = format!(
                "{}:{}",
                String::from_utf8_lossy(&host),
                u16::from_be_bytes(port)
            );
            stream
                .write_all(&[0x05, fake.reply, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 22])
                .await
                .unwrap();
            if fake.reply == 0x00 {
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await.unwrap();
                stream.write_all(&buf).await.unwrap();
            }
            target
        });
        let proxy = SocksProxy {
            host: addr.ip().to_string(),
            port: addr.port(),
            user: fake.require_auth.map(|(user, _)| user.to_string()),
            password: fake.require_auth.map(|(_, password)| password.to_string()),
        };
        (proxy, handle)
    }

    #[tokio::test]
    async fn connects_without_auth_and_relays_bytes() {
        let (proxy, server) = spawn_fake_proxy(FakeProxy {
            require_auth: None,
            reply: 0x00,
        })
        .await;
        let mut stream = connect(&proxy, "a.example", 22, SOCKS_CONNECT_TIMEOUT)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        assert_eq!(server.await.unwrap(), "a.example:22");
    }

    #[tokio::test]
    async fn authenticates_with_user_and_password() {
        let (proxy, server) = spawn_fake_proxy(FakeProxy {
            require_auth: Some(("alice", "secret")),
            reply: 0x00,
        })
        .await;
        let mut stream = connect(&proxy, "b.example", 2222, SOCKS_CONNECT_TIMEOUT)
            .await
            .unwrap();
        stream.write_all(b"abcd").await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(server.await.unwrap(), "b.example:2222");
    }

    #[tokio::test]
    async fn relay_pipes_local_stream_through_proxy() {
        let (proxy, server) = spawn_fake_proxy(FakeProxy {
            require_auth: Some(("alice", "secret")),
            reply: 0x00,
        })
        .await;
        let (mut local, mut remote_side) = tokio::io::duplex(64);
        let relay_task =
            tokio::spawn(async move { relay(&proxy, "a.example", 22, &mut remote_side).await });
        local.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        local.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        assert_eq!(server.await.unwrap(), "a.example:22");
        drop(local);
        timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("relay finished")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn relay_reports_unreachable_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let proxy = SocksProxy {
            host: addr.ip().to_string(),
            port: addr.port(),
            user: None,
            password: None,
        };
        let (_local, mut remote_side) = tokio::io::duplex(64);
        let err = relay(&proxy, "a.example", 22, &mut remote_side)
            .await
            .unwrap_err();
        assert!(err.message().contains("failed to reach socks proxy"), "{err}");
    }

    #[tokio::test]
    async fn wrong_password_is_connection_error() {
        let (mut proxy, _server) = spawn_fake_proxy(FakeProxy {
            require_auth: Some(("alice", "secret")),
            reply: 0x00,
        })
        .await;
        proxy.password = Some("wrong".to_string());
        let err = connect(&proxy, "a.example", 22, SOCKS_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::connection("socks authentication failed"));
    }

    #[tokio::test]
    async fn refused_connect_reports_reply_code() {
        let (proxy, _server) = spawn_fake_proxy(FakeProxy {
            require_auth: None,
            reply: 0x05,
        })
        .await;
        let err = connect(&proxy, "a.example", 22, SOCKS_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.message().contains("connection refused"), "{err}");
    }

    #[tokio::test]
    async fn silent_proxy_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let proxy = SocksProxy {
            host: addr.ip().to_string(),
            port: addr.port(),
            user: None,
            password: None,
        };
        let err = connect(&proxy, "a.example", 22, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.message().contains("timed out"), "{err}");
    }

    #[test]
    fn builds_ip_and_domain_requests() {
        assert_eq!(
            connect_request("10.0.0.1", 22).unwrap(),
            vec![5, 1, 0, ATYP_IPV4, 10, 0, 0, 1, 0, 22]
        );
        let domain = connect_request("ab", 80).unwrap();
        assert_eq!(domain, vec![5, 1, 0, ATYP_DOMAIN, 2, b'a', b'b', 0, 80]);
        assert!(connect_request("", 80).is_err());
    }

    #[test]
    fn parses_host_port_pairs() {
        assert_eq!(
            parse_host_port("proxy.local:1080").unwrap(),
            ("proxy.local".to_string(), 1080)
        );
        assert!(parse_host_port("proxy.local").is_err());
        assert!(parse_host_port("proxy.local:http").is_err());
    }
}
