//! MySQL 프로토콜 패킷 처리
//!
//! 패킷 = 3 bytes 길이 + 1 byte 시퀀스 + 본문. 본문이 0xffffff 이상이면
//! 같은 형식의 연속 패킷으로 나뉘어 옵니다.

use crate::config::TlsConfig;
use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(feature = "tls")]
use tokio_rustls::client::TlsStream;

pub const MAX_PACKET_SIZE: usize = 0x00ff_ffff;

pub const OK_HEADER: u8 = 0x00;
pub const EOF_HEADER: u8 = 0xfe;
pub const ERR_HEADER: u8 = 0xff;
pub const LOCAL_INFILE_HEADER: u8 = 0xfb;

/// 명령 코드
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_BINLOG_DUMP: u8 = 0x12;
    pub const COM_REGISTER_SLAVE: u8 = 0x15;
    pub const COM_BINLOG_DUMP_GTID: u8 = 0x1e;
}

/// 평문 TCP 또는 TLS 스트림
enum PacketStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "tls")]
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl PacketStream {
    async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        use tokio::io::AsyncReadExt;
        match self {
            PacketStream::Plain(s) => s.read_exact(buf).await.map(|_| ()),
            #[cfg(feature = "tls")]
            PacketStream::Tls(s) => s.read_exact(buf).await.map(|_| ()),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            PacketStream::Plain(s) => {
                s.get_mut().write_all(buf).await?;
                s.get_mut().flush().await
            }
            #[cfg(feature = "tls")]
            PacketStream::Tls(s) => {
                s.get_mut().write_all(buf).await?;
                s.get_mut().flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            PacketStream::Plain(s) => s.get_mut().shutdown().await,
            #[cfg(feature = "tls")]
            PacketStream::Tls(s) => s.get_mut().shutdown().await,
        }
    }
}

/// MySQL 패킷 채널
pub struct PacketChannel {
    stream: PacketStream,
    sequence: u8,
    is_tls: bool,
}

impl std::fmt::Debug for PacketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketChannel")
            .field("sequence", &self.sequence)
            .field("is_tls", &self.is_tls)
            .finish()
    }
}

impl PacketChannel {
    /// 새 패킷 채널 생성 (TCP 연결)
    pub async fn connect(hostname: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let addr = format!("{}:{}", hostname, port);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "Timed out connecting to {} after {:?}",
                    addr, connect_timeout
                ))
            })?
            .map_err(|e| {
                CdcError::ConnectionError(format!("Failed to connect to {}: {}", addr, e))
            })?;
        stream.set_nodelay(true).ok();

        debug!("Connected to MySQL at {}", addr);

        Ok(PacketChannel {
            stream: PacketStream::Plain(BufReader::new(stream)),
            sequence: 0,
            is_tls: false,
        })
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// 새 명령을 시작할 때 시퀀스 초기화
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// 패킷 읽기 (연속 패킷은 하나로 합침)
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            // 패킷 헤더 읽기 (3 bytes length + 1 byte sequence)
            let mut header = [0u8; 4];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet header: {}", e)))?;
            let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            self.sequence = header[3].wrapping_add(1);

            let start = payload.len();
            payload.resize(start + length, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to read packet body: {}", e)))?;

            if length < MAX_PACKET_SIZE {
                return Ok(payload);
            }
        }
    }

    /// 패킷 쓰기 (현재 시퀀스부터 이어서)
    pub async fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let mut chunks = data.chunks(MAX_PACKET_SIZE).peekable();
        let mut buf = Vec::with_capacity(data.len().min(MAX_PACKET_SIZE) + 4);
        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            buf.clear();
            buf.extend_from_slice(&(chunk.len() as u32).to_le_bytes()[..3]);
            buf.push(self.sequence);
            buf.extend_from_slice(chunk);
            self.stream
                .write_all(&buf)
                .await
                .map_err(|e| CdcError::IoError(format!("Failed to write packet: {}", e)))?;
            self.sequence = self.sequence.wrapping_add(1);

            // 최대 크기와 정확히 같으면 빈 패킷으로 끝을 알림
            if chunk.len() < MAX_PACKET_SIZE {
                return Ok(());
            }
            if chunks.peek().is_none() {
                buf.clear();
                buf.extend_from_slice(&[0, 0, 0, self.sequence]);
                self.stream
                    .write_all(&buf)
                    .await
                    .map_err(|e| CdcError::IoError(format!("Failed to write packet: {}", e)))?;
                self.sequence = self.sequence.wrapping_add(1);
                return Ok(());
            }
        }
    }

    /// 명령 패킷 전송 (시퀀스 0부터)
    pub async fn write_command(&mut self, command: u8, body: &[u8]) -> Result<()> {
        self.reset_sequence();
        let mut data = Vec::with_capacity(body.len() + 1);
        data.push(command);
        data.extend_from_slice(body);
        self.write_packet(&data).await
    }

    /// OK 패킷을 기다림 (ERR 이면 서버 에러)
    pub async fn read_ok(&mut self) -> Result<()> {
        let packet = self.read_packet().await?;
        match packet.first() {
            Some(&OK_HEADER) => Ok(()),
            Some(&ERR_HEADER) => Err(parse_err_packet(&packet)),
            Some(other) => Err(CdcError::ProtocolError(format!(
                "Expected OK packet, got header 0x{:02x}",
                other
            ))),
            None => Err(CdcError::ProtocolError("Empty packet".to_string())),
        }
    }

    /// COM_QUERY 실행 후 텍스트 결과셋 반환 (결과셋이 없으면 빈 ResultSet)
    pub async fn query(&mut self, sql: &str) -> Result<ResultSet> {
        self.write_command(command::COM_QUERY, sql.as_bytes()).await?;

        let first = self.read_packet().await?;
        match first.first() {
            Some(&OK_HEADER) => return Ok(ResultSet::default()),
            Some(&ERR_HEADER) => return Err(parse_err_packet(&first)),
            Some(&LOCAL_INFILE_HEADER) => {
                return Err(CdcError::NotSupported("LOCAL INFILE".to_string()))
            }
            None => return Err(CdcError::ProtocolError("Empty query response".to_string())),
            _ => {}
        }

        let column_count = read_lenenc_int(&mut Cursor::new(first.as_slice()))
            .map_err(|e| CdcError::ProtocolError(format!("Invalid column count: {}", e)))?
            as usize;

        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let packet = self.read_packet().await?;
            columns.push(parse_column_name(&packet)?);
        }
        // 컬럼 정의 뒤의 EOF
        let eof = self.read_packet().await?;
        if !is_eof_packet(&eof) {
            return Err(CdcError::ProtocolError(
                "Expected EOF after column definitions".to_string(),
            ));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet().await?;
            if is_eof_packet(&packet) {
                break;
            }
            if packet.first() == Some(&ERR_HEADER) {
                return Err(parse_err_packet(&packet));
            }
            rows.push(parse_text_row(&packet, column_count)?);
        }

        Ok(ResultSet { columns, rows })
    }

    /// 결과를 사용하지 않는 쿼리
    pub async fn execute(&mut self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    /// TLS로 업그레이드 (SSL request 전송 후 호출)
    ///
    /// 시퀀스 번호는 평문 구간에서 이어집니다.
    #[cfg(feature = "tls")]
    pub async fn upgrade_to_tls(self, host: &str, tls: &TlsConfig) -> Result<Self> {
        use std::sync::Arc;
        use tokio_rustls::rustls::pki_types::ServerName;
        use tokio_rustls::TlsConnector;

        let config = build_rustls_config(tls)?;
        let connector = TlsConnector::from(Arc::new(config));
        let name = tls.server_name.clone().unwrap_or_else(|| host.to_string());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| CdcError::Config(format!("Invalid server name for TLS: {}", name)))?;

        let tcp = match self.stream {
            PacketStream::Plain(s) => s.into_inner(),
            PacketStream::Tls(_) => {
                return Err(CdcError::ProtocolError("Already using TLS".to_string()))
            }
        };
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("TLS handshake failed: {}", e)))?;
        debug!("Upgraded connection to TLS");

        Ok(PacketChannel {
            stream: PacketStream::Tls(Box::new(BufReader::new(tls_stream))),
            sequence: self.sequence,
            is_tls: true,
        })
    }

    /// TLS 기능 없이 빌드된 경우
    #[cfg(not(feature = "tls"))]
    pub async fn upgrade_to_tls(self, _host: &str, _tls: &TlsConfig) -> Result<Self> {
        Err(CdcError::NotSupported(
            "TLS requested but the crate was built without the `tls` feature".to_string(),
        ))
    }

    /// COM_QUIT 후 소켓 종료 (에러 무시)
    pub async fn close(&mut self) {
        if self.write_command(command::COM_QUIT, &[]).await.is_ok() {
            debug!("Sent COM_QUIT");
        }
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(feature = "tls")]
fn build_rustls_config(config: &TlsConfig) -> Result<tokio_rustls::rustls::ClientConfig> {
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};

    let mut root_store = RootCertStore::empty();
    if let Some(ca_path) = &config.ca_cert_path {
        let mut reader = std::io::BufReader::new(
            std::fs::File::open(ca_path)
                .map_err(|e| CdcError::Config(format!("Failed to open CA cert file: {}", e)))?,
        );
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert =
                cert.map_err(|e| CdcError::Config(format!("Failed to parse CA certs: {}", e)))?;
            root_store
                .add(cert)
                .map_err(|e| CdcError::Config(format!("Failed to add CA cert: {}", e)))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = ClientConfig::builder().with_root_certificates(root_store);
    match (&config.client_cert_path, &config.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut cert_reader = std::io::BufReader::new(
                std::fs::File::open(cert_path)
                    .map_err(|e| CdcError::Config(format!("Failed to open client cert: {}", e)))?,
            );
            let certs = rustls_pemfile::certs(&mut cert_reader)
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| CdcError::Config(format!("Failed to parse client certs: {}", e)))?;
            let mut key_reader = std::io::BufReader::new(
                std::fs::File::open(key_path)
                    .map_err(|e| CdcError::Config(format!("Failed to open client key: {}", e)))?,
            );
            let key = rustls_pemfile::private_key(&mut key_reader)
                .map_err(|e| CdcError::Config(format!("Failed to parse client key: {}", e)))?
                .ok_or_else(|| CdcError::Config("No private key found".to_string()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| CdcError::Config(format!("Failed to set client auth: {}", e)))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// 텍스트 프로토콜 결과셋
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 컬럼 이름으로 값 조회 (대소문자 무시)
    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// Greeting 패킷 파싱
#[derive(Debug, Clone)]
pub struct GreetingPacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    pub scramble: Vec<u8>,
    pub server_capabilities: u32,
    pub server_collation: u8,
    pub server_status: u16,
    pub auth_plugin_name: String,
}

impl GreetingPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.first() == Some(&ERR_HEADER) {
            return Err(parse_err_packet(data));
        }
        Self::parse_inner(data)
            .map_err(|e| CdcError::ProtocolError(format!("Invalid greeting packet: {}", e)))
    }

    fn parse_inner(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);

        let protocol_version = cursor.read_u8()?;
        let server_version = read_null_terminated_string(&mut cursor)?;
        let thread_id = cursor.read_u32::<LittleEndian>()?;

        // Auth plugin data part 1 (8 bytes)
        let mut scramble = vec![0u8; 8];
        cursor.read_exact(&mut scramble)?;

        // Filler (1 byte, always 0x00)
        cursor.read_u8()?;

        let capabilities_lower = cursor.read_u16::<LittleEndian>()?;
        let server_collation = cursor.read_u8()?;
        let server_status = cursor.read_u16::<LittleEndian>()?;
        let capabilities_upper = cursor.read_u16::<LittleEndian>()?;
        let server_capabilities = (capabilities_upper as u32) << 16 | capabilities_lower as u32;

        let auth_data_len = cursor.read_u8()?;

        // Reserved (10 bytes)
        let mut reserved = [0u8; 10];
        cursor.read_exact(&mut reserved)?;

        // Auth plugin data part 2 (at least 13 bytes, 마지막 null byte 제외)
        let part2_len = std::cmp::max(13, auth_data_len.saturating_sub(8)) as usize;
        let mut part2 = vec![0u8; part2_len];
        cursor.read_exact(&mut part2)?;
        if part2.last() == Some(&0) {
            part2.pop();
        }
        scramble.extend_from_slice(&part2);

        let auth_plugin_name = if server_capabilities & crate::auth::capabilities::PLUGIN_AUTH != 0
        {
            read_null_terminated_string(&mut cursor).unwrap_or_default()
        } else {
            String::new()
        };

        Ok(GreetingPacket {
            protocol_version,
            server_version,
            thread_id,
            scramble,
            server_capabilities,
            server_collation,
            server_status,
            auth_plugin_name: if auth_plugin_name.is_empty() {
                "mysql_native_password".to_string()
            } else {
                auth_plugin_name
            },
        })
    }

    pub fn has_capability(&self, flag: u32) -> bool {
        self.server_capabilities & flag != 0
    }
}

/// null로 끝나는 문자열 읽기 (끝에 NUL이 없으면 남은 전체)
fn read_null_terminated_string(cursor: &mut Cursor<&[u8]>) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    loop {
        match cursor.read_u8() {
            Ok(0) => break,
            Ok(byte) => bytes.push(byte),
            Err(e) if bytes.is_empty() => return Err(e),
            Err(_) => break,
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// length-encoded integer
pub fn read_lenenc_int(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => cursor.read_u64::<LittleEndian>(),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid length-encoded integer prefix 0x{:02x}", byte),
        )),
    }
}

fn read_lenenc_bytes(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Vec<u8>> {
    let len = read_lenenc_int(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// Column Definition 41: catalog, schema, table, org_table, name, ...
fn parse_column_name(packet: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(packet);
    let name = (|| -> std::io::Result<Vec<u8>> {
        for _ in 0..4 {
            read_lenenc_bytes(&mut cursor)?;
        }
        read_lenenc_bytes(&mut cursor)
    })()
    .map_err(|e| CdcError::ProtocolError(format!("Invalid column definition: {}", e)))?;
    Ok(String::from_utf8_lossy(&name).into_owned())
}

fn parse_text_row(packet: &[u8], column_count: usize) -> Result<Vec<Option<String>>> {
    let mut cursor = Cursor::new(packet);
    let mut row = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        if cursor.get_ref().get(cursor.position() as usize) == Some(&0xfb) {
            cursor.set_position(cursor.position() + 1);
            row.push(None);
            continue;
        }
        let value = read_lenenc_bytes(&mut cursor)
            .map_err(|e| CdcError::ProtocolError(format!("Invalid result row: {}", e)))?;
        row.push(Some(String::from_utf8_lossy(&value).into_owned()));
    }
    Ok(row)
}

/// ERR 패킷: 0xff + code(2) + '#' + sql_state(5) + message
pub fn parse_err_packet(data: &[u8]) -> CdcError {
    if data.len() < 3 {
        return CdcError::ProtocolError("Truncated ERR packet".to_string());
    }
    let code = u16::from_le_bytes([data[1], data[2]]);
    let (state, message) = if data.get(3) == Some(&b'#') && data.len() >= 9 {
        (
            String::from_utf8_lossy(&data[4..9]).into_owned(),
            String::from_utf8_lossy(&data[9..]).into_owned(),
        )
    } else {
        (
            "HY000".to_string(),
            String::from_utf8_lossy(&data[3..]).into_owned(),
        )
    };
    CdcError::ServerError {
        code,
        state,
        message,
    }
}

/// Error 패킷 확인
pub fn is_error_packet(data: &[u8]) -> bool {
    data.first() == Some(&ERR_HEADER)
}

/// OK 패킷 확인
pub fn is_ok_packet(data: &[u8]) -> bool {
    data.first() == Some(&OK_HEADER)
}

/// EOF 패킷 확인 (0xfe 로 시작하는 9 bytes 미만 패킷)
pub fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&EOF_HEADER) && data.len() < 9
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_is_error_packet() {
        assert!(is_error_packet(&[0xFF, 0x01, 0x02]));
        assert!(!is_error_packet(&[0x00, 0x01, 0x02]));
    }

    #[test]
    fn test_is_ok_packet() {
        assert!(is_ok_packet(&[0x00, 0x01, 0x02]));
        assert!(!is_ok_packet(&[0xFF, 0x01, 0x02]));
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xff];
        data.extend_from_slice(&1236u16.to_le_bytes());
        data.extend_from_slice(b"#HY000Could not find first log file name");
        match parse_err_packet(&data) {
            CdcError::ServerError {
                code,
                state,
                message,
            } => {
                assert_eq!(code, 1236);
                assert_eq!(state, "HY000");
                assert!(message.starts_with("Could not find"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_parse_greeting() {
        let greeting = GreetingPacket::parse(&fake::greeting()).unwrap();
        assert_eq!(greeting.server_version, "8.0.36-fake");
        assert_eq!(greeting.thread_id, 7);
        assert_eq!(greeting.scramble, b"abcdefghijklmnopqrst".to_vec());
        assert_eq!(greeting.auth_plugin_name, "mysql_native_password");
    }

    #[tokio::test]
    async fn test_query_text_result_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (seq, body) = fake::read_packet(&mut socket).await.unwrap();
            assert_eq!(seq, 0);
            assert_eq!(body[0], command::COM_QUERY);
            fake::write_result_set(
                &mut socket,
                &["Variable_name", "Value"],
                &[vec![Some("binlog_checksum"), Some("CRC32")], vec![Some("x"), None]],
            )
            .await;
        });

        let mut channel = PacketChannel::connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        let result = channel
            .query("SHOW GLOBAL VARIABLES LIKE 'BINLOG_CHECKSUM'")
            .await
            .unwrap();
        assert_eq!(result.get(0, "value"), Some("CRC32"));
        assert_eq!(result.get(1, "Value"), None);
        assert_eq!(result.rows.len(), 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_multi_packet_payload() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            fake::write_packet(&mut socket, 0, &vec![7u8; MAX_PACKET_SIZE]).await;
            fake::write_packet(&mut socket, 1, &[8u8; 3]).await;
        });

        let mut channel = PacketChannel::connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        let packet = channel.read_packet().await.unwrap();
        assert_eq!(packet.len(), MAX_PACKET_SIZE + 3);
        assert_eq!(packet[MAX_PACKET_SIZE], 8);
        server.await.unwrap();
    }
}
