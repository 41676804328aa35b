//! MySQL 인증 처리
//!
//! mysql_native_password, caching_sha2_password (fast auth / full auth),
//! auth switch, TLS 업그레이드 구현

use crate::config::TlsConfig;
use crate::error::{CdcError, Result};
use crate::protocol::{parse_err_packet, GreetingPacket, PacketChannel, ERR_HEADER, OK_HEADER};
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tracing::{debug, warn};

pub const NATIVE_PASSWORD: &str = "mysql_native_password";
pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// utf8mb4_general_ci
pub const DEFAULT_COLLATION: u8 = 45;

const MAX_PACKET: u32 = 16 * 1024 * 1024;

/// Client capability flags
pub mod capabilities {
    pub const LONG_PASSWORD: u32 = 1;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const PROTOCOL_41: u32 = 512;
    pub const SSL: u32 = 2048;
    pub const TRANSACTIONS: u32 = 8192;
    pub const SECURE_CONNECTION: u32 = 32768;
    pub const MULTI_STATEMENTS: u32 = 1 << 16;
    pub const MULTI_RESULTS: u32 = 1 << 17;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// 로그인 정보
#[derive(Clone, Copy)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: &'a str,
    pub database: Option<&'a str>,
}

/// Native password 인증 응답 생성
pub fn create_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let stage1 = sha1(password.as_bytes());

    // SHA1(SHA1(password))
    let stage2 = sha1(&stage1);

    // SHA1(scramble + SHA1(SHA1(password)))
    let mut combined = scramble.to_vec();
    combined.extend_from_slice(&stage2);
    let stage3 = sha1(&combined);

    // XOR(SHA1(password), SHA1(scramble + SHA1(SHA1(password))))
    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// caching_sha2_password 인증 응답
///
/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + scramble))
pub fn create_sha256_auth_response(password: &str, scramble: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = sha256(password.as_bytes());
    let stage2 = sha256(&stage1);
    let mut combined = stage2;
    combined.extend_from_slice(scramble);
    let stage3 = sha256(&combined);

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

fn sha1(data: &[u8]) -> Vec<u8> {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn sha256(data: &[u8]) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// 플러그인별 scramble 응답
fn plugin_auth_response(plugin: &str, password: &str, scramble: &[u8]) -> Result<Vec<u8>> {
    match plugin {
        NATIVE_PASSWORD => Ok(create_auth_response(password, scramble)),
        CACHING_SHA2_PASSWORD => Ok(create_sha256_auth_response(password, scramble)),
        other => Err(CdcError::NotSupported(format!(
            "authentication plugin {}",
            other
        ))),
    }
}

fn client_capabilities(database: Option<&str>, ssl: bool) -> u32 {
    let mut flags = capabilities::LONG_PASSWORD
        | capabilities::LONG_FLAG
        | capabilities::PROTOCOL_41
        | capabilities::TRANSACTIONS
        | capabilities::SECURE_CONNECTION
        | capabilities::MULTI_STATEMENTS
        | capabilities::MULTI_RESULTS
        | capabilities::PLUGIN_AUTH;
    if database.is_some() {
        flags |= capabilities::CONNECT_WITH_DB;
    }
    if ssl {
        flags |= capabilities::SSL;
    }
    flags
}

/// SSL request 패킷 (handshake response 앞부분만)
pub fn create_ssl_request(database: Option<&str>, collation: u8) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(32);
    buffer.write_u32::<LittleEndian>(client_capabilities(database, true))?;
    buffer.write_u32::<LittleEndian>(MAX_PACKET)?;
    buffer.write_u8(collation)?;
    buffer.write_all(&[0u8; 23])?;
    Ok(buffer)
}

/// 인증 패킷 생성
pub fn create_handshake_response(
    credentials: &Credentials<'_>,
    auth_response: &[u8],
    plugin: &str,
    collation: u8,
    ssl: bool,
) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();

    buffer.write_u32::<LittleEndian>(client_capabilities(credentials.database, ssl))?;
    buffer.write_u32::<LittleEndian>(MAX_PACKET)?;
    buffer.write_u8(collation)?;

    // Reserved (23 bytes of zeros)
    buffer.write_all(&[0u8; 23])?;

    // Username (null-terminated string)
    buffer.write_all(credentials.user.as_bytes())?;
    buffer.write_u8(0)?;

    buffer.write_u8(auth_response.len() as u8)?;
    buffer.write_all(auth_response)?;

    if let Some(db) = credentials.database {
        buffer.write_all(db.as_bytes())?;
        buffer.write_u8(0)?;
    }

    buffer.write_all(plugin.as_bytes())?;
    buffer.write_u8(0)?;

    Ok(buffer)
}

/// RSA 공개키로 비밀번호 암호화 (full auth, 평문 연결)
///
/// (password + NUL) XOR scramble 을 OAEP(SHA1)로 암호화
pub fn encrypt_password(password: &str, scramble: &[u8], public_key_pem: &str) -> Result<Vec<u8>> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;
    use rsa::{Oaep, RsaPublicKey};

    let pem = public_key_pem.trim();
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| CdcError::ProtocolError(format!("Invalid server public key: {}", e)))?;

    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    if !scramble.is_empty() {
        for (i, byte) in plain.iter_mut().enumerate() {
            *byte ^= scramble[i % scramble.len()];
        }
    }

    key.encrypt(&mut rand::thread_rng(), Oaep::new::<sha1::Sha1>(), &plain)
        .map_err(|e| CdcError::ProtocolError(format!("RSA encryption failed: {}", e)))
}

/// 연결 직후의 handshake 전체 수행
///
/// TLS 설정이 있으면 SSL request 후 채널을 업그레이드하므로 채널을 소유권째 받습니다.
pub async fn authenticate(
    mut channel: PacketChannel,
    host: &str,
    credentials: &Credentials<'_>,
    tls: Option<&TlsConfig>,
) -> Result<(PacketChannel, GreetingPacket)> {
    let greeting = GreetingPacket::parse(&channel.read_packet().await?)?;
    debug!(
        "MySQL greeting: version={}, thread_id={}, plugin={}",
        greeting.server_version, greeting.thread_id, greeting.auth_plugin_name
    );

    let ssl = tls.is_some();
    if let Some(tls) = tls {
        if !greeting.has_capability(capabilities::SSL) {
            return Err(CdcError::NotSupported(
                "server does not support SSL".to_string(),
            ));
        }
        let request = create_ssl_request(credentials.database, DEFAULT_COLLATION)?;
        channel.write_packet(&request).await?;
        channel = channel.upgrade_to_tls(host, tls).await?;
    }

    let mut plugin = greeting.auth_plugin_name.clone();
    let mut scramble = greeting.scramble.clone();
    let response = match plugin_auth_response(&plugin, credentials.password, &scramble) {
        Ok(response) => response,
        Err(_) => {
            // 서버가 auth switch 로 원하는 플러그인을 다시 알려줌
            warn!("Unknown auth plugin {}, falling back to {}", plugin, NATIVE_PASSWORD);
            plugin = NATIVE_PASSWORD.to_string();
            create_auth_response(credentials.password, &scramble)
        }
    };
    let packet =
        create_handshake_response(credentials, &response, &plugin, DEFAULT_COLLATION, ssl)?;
    channel.write_packet(&packet).await?;

    loop {
        let packet = channel.read_packet().await?;
        match packet.first().copied() {
            Some(OK_HEADER) => {
                debug!("Authenticated as {}", credentials.user);
                return Ok((channel, greeting));
            }
            Some(ERR_HEADER) => return Err(parse_err_packet(&packet)),
            Some(0xfe) => {
                // Auth switch request: 0xfe + plugin NUL + data
                let body = &packet[1..];
                let name_end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                plugin = String::from_utf8_lossy(&body[..name_end]).into_owned();
                let mut data = body.get(name_end + 1..).unwrap_or(&[]).to_vec();
                if data.last() == Some(&0) {
                    data.pop();
                }
                scramble = data;
                debug!("Auth switch to {}", plugin);
                let response = plugin_auth_response(&plugin, credentials.password, &scramble)?;
                channel.write_packet(&response).await?;
            }
            Some(0x01) => match packet.get(1).copied() {
                // caching_sha2_password: 0x03 fast auth 성공, 0x04 full auth 필요
                Some(0x03) => debug!("caching_sha2_password fast auth succeeded"),
                Some(0x04) => {
                    if channel.is_tls() {
                        let mut plain = credentials.password.as_bytes().to_vec();
                        plain.push(0);
                        channel.write_packet(&plain).await?;
                    } else {
                        channel.write_packet(&[0x02]).await?;
                        let key_packet = channel.read_packet().await?;
                        if key_packet.first() == Some(&ERR_HEADER) {
                            return Err(parse_err_packet(&key_packet));
                        }
                        let pem = String::from_utf8_lossy(key_packet.get(1..).unwrap_or(&[]))
                            .into_owned();
                        let encrypted = encrypt_password(credentials.password, &scramble, &pem)?;
                        channel.write_packet(&encrypted).await?;
                    }
                }
                other => {
                    return Err(CdcError::ProtocolError(format!(
                        "Unexpected auth more-data packet {:?}",
                        other
                    )))
                }
            },
            other => {
                return Err(CdcError::ProtocolError(format!(
                    "Unexpected packet during authentication: {:?}",
                    other
                )))
            }
        }
    }
}
