//! FlowFile v3 패키지 포맷
//!
//! ```text
//! "NiFiFF3"
//! [field len] 속성 개수
//! ([field len] name [field len] value) * 개수
//! [u64 BE]    payload 크기
//! payload
//! ```
//!
//! field len은 u16 BE. 0xFFFF 이상이면 0xFFFF 뒤에 u32 BE가 따라옴.
//! 체크섬(`checksumType`, `checksum`)은 payload만 대상으로 함

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::str::FromStr;

use bytes::Bytes;
use sha2::Digest;

use crate::config::Config;
use crate::{Error, Result};

/// 패키지 매직
pub const MAGIC: &[u8; 7] = b"NiFiFF3";

/// 체크섬 알고리즘 속성명
pub const CHECKSUM_TYPE: &str = "checksumType";

/// 체크섬 값 속성명
pub const CHECKSUM: &str = "checksum";

const CHAIN_PREFIX: &str = "custodyChain.";

/// 순서를 유지하는 속성 목록
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// 같은 이름이 있으면 값 교체, 없으면 끝에 추가
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.0.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.0.iter().position(|(n, _)| n == name)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 다른 속성 목록을 덮어씀
    pub fn merge(&mut self, other: &Attributes) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    /// `custodyChain.N.*`를 `custodyChain.N+1.*`로 이동
    pub fn shift_custody_chain(&mut self) {
        for (name, _) in self.0.iter_mut() {
            let Some(rest) = name.strip_prefix(CHAIN_PREFIX) else {
                continue;
            };
            let Some((idx, field)) = rest.split_once('.') else {
                continue;
            };
            if let Ok(idx) = idx.parse::<u32>() {
                *name = format!("{}{}.{}", CHAIN_PREFIX, idx + 1, field);
            }
        }
    }

    /// 속성 헤더 직렬화 크기 (매직 + 속성 + payload 크기 필드)
    pub fn encoded_len(&self) -> usize {
        let mut len = MAGIC.len() + field_len_size(self.0.len()) + 8;
        for (n, v) in &self.0 {
            len += field_len_size(n.len()) + n.len();
            len += field_len_size(v.len()) + v.len();
        }
        len
    }
}

impl FromIterator<(String, String)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (n, v) in iter {
            attrs.set(&n, &v);
        }
        attrs
    }
}

fn field_len_size(len: usize) -> usize {
    if len < 0xFFFF {
        2
    } else {
        6
    }
}

fn write_field_len(out: &mut Vec<u8>, len: usize) {
    if len < 0xFFFF {
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&0xFFFFu16.to_be_bytes());
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

/// 속성 헤더 인코딩
pub fn encode_header(attrs: &Attributes, payload_size: u64, out: &mut Vec<u8>) {
    out.reserve(attrs.encoded_len());
    out.extend_from_slice(MAGIC);
    write_field_len(out, attrs.len());
    for (name, value) in attrs.iter() {
        write_field_len(out, name.len());
        out.extend_from_slice(name.as_bytes());
        write_field_len(out, value.len());
        out.extend_from_slice(value.as_bytes());
    }
    out.extend_from_slice(&payload_size.to_be_bytes());
}

/// 증분 파싱 결과
#[derive(Debug, PartialEq, Eq)]
pub enum HeaderParse {
    /// 바이트가 더 필요함
    Incomplete,

    Complete {
        attrs: Attributes,
        payload_size: u64,
        /// payload 시작 위치
        header_len: usize,
    },
}

/// 슬라이스 커서. 바이트가 모자라면 None
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let out = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    fn field_len(&mut self) -> Option<usize> {
        let short = u16::from_be_bytes(self.take(2)?.try_into().ok()?);
        if short < 0xFFFF {
            return Some(short as usize);
        }
        Some(u32::from_be_bytes(self.take(4)?.try_into().ok()?) as usize)
    }

    fn string(&mut self) -> Option<Result<String>> {
        let len = self.field_len()?;
        let raw = self.take(len)?;
        Some(String::from_utf8(raw.to_vec()).map_err(|_| Error::NotFlowFile))
    }
}

/// 버퍼 앞부분에서 속성 헤더 파싱
///
/// 매직이 다르면 `NotFlowFile`, 아직 바이트가 모자라면 `Incomplete`
pub fn parse_header(buf: &[u8]) -> Result<HeaderParse> {
    let n = buf.len().min(MAGIC.len());
    if buf[..n] != MAGIC[..n] {
        return Err(Error::NotFlowFile);
    }

    let mut cur = Cursor { buf, pos: MAGIC.len() };
    if buf.len() < MAGIC.len() {
        return Ok(HeaderParse::Incomplete);
    }
    let Some(count) = cur.field_len() else {
        return Ok(HeaderParse::Incomplete);
    };

    let mut attrs = Attributes::new();
    for _ in 0..count {
        let Some(name) = cur.string() else {
            return Ok(HeaderParse::Incomplete);
        };
        let Some(value) = cur.string() else {
            return Ok(HeaderParse::Incomplete);
        };
        attrs.set(&name?, &value?);
    }

    let Some(size) = cur.take(8) else {
        return Ok(HeaderParse::Incomplete);
    };
    let mut raw = [0u8; 8];
    raw.copy_from_slice(size);

    Ok(HeaderParse::Complete {
        attrs,
        payload_size: u64::from_be_bytes(raw),
        header_len: cur.pos,
    })
}

fn read_field_len<R: Read>(r: &mut R) -> Result<usize> {
    let mut short = [0u8; 2];
    read_exact(r, &mut short)?;
    let short = u16::from_be_bytes(short);
    if short < 0xFFFF {
        return Ok(short as usize);
    }
    let mut long = [0u8; 4];
    read_exact(r, &mut long)?;
    Ok(u32::from_be_bytes(long) as usize)
}

fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_field_len(r)?;
    let mut raw = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut raw)?;
    if raw.len() != len {
        return Err(Error::TruncatedFlowFile);
    }
    String::from_utf8(raw).map_err(|_| Error::NotFlowFile)
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::TruncatedFlowFile,
        _ => Error::Io(e),
    })
}

/// 스트림에서 속성 헤더 읽기. 레코드 경계에서 EOF면 None
pub fn read_header<R: Read>(r: &mut R) -> Result<Option<(Attributes, u64)>> {
    let mut magic = [0u8; 7];
    let mut got = 0;
    while got < magic.len() {
        match r.read(&mut magic[got..])? {
            0 if got == 0 => return Ok(None),
            0 => return Err(Error::TruncatedFlowFile),
            n => got += n,
        }
    }
    if &magic != MAGIC {
        return Err(Error::NotFlowFile);
    }

    let count = read_field_len(r)?;
    let mut attrs = Attributes::new();
    for _ in 0..count {
        let name = read_string(r)?;
        let value = read_string(r)?;
        attrs.set(&name, &value);
    }

    let mut size = [0u8; 8];
    read_exact(r, &mut size)?;
    Ok(Some((attrs, u64::from_be_bytes(size))))
}

/// 지원 체크섬 알고리즘
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Sha256,
    Sha512,
    Sha1,
    Md5,
    Crc32,
}

impl ChecksumKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumKind::Sha256 => "SHA256",
            ChecksumKind::Sha512 => "SHA512",
            ChecksumKind::Sha1 => "SHA1",
            ChecksumKind::Md5 => "MD5",
            ChecksumKind::Crc32 => "CRC32",
        }
    }

    pub fn hasher(&self) -> StreamHasher {
        match self {
            ChecksumKind::Sha256 => StreamHasher::Sha256(sha2::Sha256::new()),
            ChecksumKind::Sha512 => StreamHasher::Sha512(sha2::Sha512::new()),
            ChecksumKind::Sha1 => StreamHasher::Sha1(sha1::Sha1::new()),
            ChecksumKind::Md5 => StreamHasher::Md5(md5::Md5::new()),
            ChecksumKind::Crc32 => StreamHasher::Crc32(crc32fast::Hasher::new()),
        }
    }
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "").as_str() {
            "SHA256" => Ok(ChecksumKind::Sha256),
            "SHA512" => Ok(ChecksumKind::Sha512),
            "SHA1" => Ok(ChecksumKind::Sha1),
            "MD5" => Ok(ChecksumKind::Md5),
            "CRC32" => Ok(ChecksumKind::Crc32),
            _ => Err(Error::UnsupportedChecksum(s.to_string())),
        }
    }
}

/// 증분 해시
pub enum StreamHasher {
    Sha256(sha2::Sha256),
    Sha512(sha2::Sha512),
    Sha1(sha1::Sha1),
    Md5(md5::Md5),
    Crc32(crc32fast::Hasher),
}

impl StreamHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Sha256(h) => h.update(data),
            StreamHasher::Sha512(h) => h.update(data),
            StreamHasher::Sha1(h) => h.update(data),
            StreamHasher::Md5(h) => h.update(data),
            StreamHasher::Crc32(h) => h.update(data),
        }
    }

    /// 소문자 hex 문자열
    pub fn finalize_hex(self) -> String {
        match self {
            StreamHasher::Sha256(h) => hex::encode(h.finalize()),
            StreamHasher::Sha512(h) => hex::encode(h.finalize()),
            StreamHasher::Sha1(h) => hex::encode(h.finalize()),
            StreamHasher::Md5(h) => hex::encode(h.finalize()),
            StreamHasher::Crc32(h) => format!("{:08x}", h.finalize()),
        }
    }
}

impl Write for StreamHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 선언된 체크섬 (알고리즘, 기대값)
///
/// 둘 다 없으면 None. 하나만 있으면 `ChecksumMissing`
pub fn declared_checksum(attrs: &Attributes) -> Result<Option<(ChecksumKind, String)>> {
    match (attrs.get(CHECKSUM_TYPE), attrs.get(CHECKSUM)) {
        (None, None) => Ok(None),
        (Some(kind), Some(value)) => Ok(Some((kind.parse()?, value.trim().to_ascii_lowercase()))),
        _ => Err(Error::ChecksumMissing),
    }
}

/// 해시 결과를 선언값과 비교
pub fn check_digest(expected: &str, actual: String) -> Result<()> {
    if expected.eq_ignore_ascii_case(&actual) {
        Ok(())
    } else {
        Err(Error::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// 메모리 상의 FlowFile 레코드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowFile {
    pub attrs: Attributes,
    pub payload: Bytes,
}

impl FlowFile {
    pub fn new(attrs: Attributes, payload: impl Into<Bytes>) -> Self {
        Self {
            attrs,
            payload: payload.into(),
        }
    }

    /// 일반 파일을 레코드로 감쌈 (`filename`, `path` 속성)
    pub fn from_file_contents(filename: &str, path: &str, payload: impl Into<Bytes>) -> Self {
        let mut attrs = Attributes::new();
        attrs.set("filename", filename);
        attrs.set("path", path);
        Self::new(attrs, payload)
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// 패키지 인코딩 (헤더 + payload)
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.attrs.encoded_len() + self.payload.len());
        encode_header(&self.attrs, self.size(), &mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// 인코딩된 길이
    pub fn encoded_len(&self) -> u64 {
        self.attrs.encoded_len() as u64 + self.size()
    }

    /// 체크섬이 없을 때만 계산해서 추가. 추가했으면 true
    pub fn add_checksum(&mut self, kind: ChecksumKind) -> bool {
        if self.attrs.get(CHECKSUM_TYPE).is_some() && self.attrs.get(CHECKSUM).is_some() {
            return false;
        }
        let mut hasher = kind.hasher();
        hasher.update(&self.payload);
        self.attrs.set(CHECKSUM_TYPE, kind.as_str());
        self.attrs.set(CHECKSUM, &hasher.finalize_hex());
        true
    }

    /// 선언된 체크섬 검증. 체크섬이 없으면 `ChecksumMissing`
    pub fn verify(&self) -> Result<()> {
        let (kind, expected) = declared_checksum(&self.attrs)?.ok_or(Error::ChecksumMissing)?;
        let mut hasher = kind.hasher();
        hasher.update(&self.payload);
        check_digest(&expected, hasher.finalize_hex())
    }

    /// 연결된 패키지 전체 디코딩
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<FlowFile>> {
        let mut records = Vec::new();
        while !data.is_empty() {
            let HeaderParse::Complete {
                attrs,
                payload_size,
                header_len,
            } = parse_header(data)?
            else {
                return Err(Error::TruncatedFlowFile);
            };
            let end = usize::try_from(payload_size)
                .ok()
                .and_then(|n| n.checked_add(header_len))
                .filter(|&end| end <= data.len())
                .ok_or(Error::TruncatedFlowFile)?;
            records.push(FlowFile::new(
                attrs,
                Bytes::copy_from_slice(&data[header_len..end]),
            ));
            data = &data[end..];
        }
        Ok(records)
    }
}

/// 스캔된 레코드 위치
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub attrs: Attributes,
    pub payload_offset: u64,
    pub payload_size: u64,
}

/// 패키지 스트림 위를 레코드 단위로 이동
pub struct Scanner<R> {
    inner: R,
    pos: u64,
    len: u64,
    failed: bool,
}

impl<R: Read + Seek> Scanner<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self {
            inner,
            pos: 0,
            len,
            failed: false,
        })
    }

    /// 원본 스트림 (payload 읽기용)
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    fn next_record(&mut self) -> Result<Option<RecordInfo>> {
        if self.pos >= self.len {
            return Ok(None);
        }
        self.inner.seek(SeekFrom::Start(self.pos))?;
        let Some((attrs, payload_size)) = read_header(&mut self.inner)? else {
            return Ok(None);
        };
        let payload_offset = self.inner.stream_position()?;
        let end = payload_offset
            .checked_add(payload_size)
            .filter(|&end| end <= self.len)
            .ok_or(Error::TruncatedFlowFile)?;
        self.pos = end;
        Ok(Some(RecordInfo {
            attrs,
            payload_offset,
            payload_size,
        }))
    }
}

impl<R: Read + Seek> Iterator for Scanner<R> {
    type Item = Result<RecordInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// 관리 연속성(custody chain) 갱신
///
/// 추가 속성 적용 → 체인 이동 → action/time 기록 → (활성화 시) hostname
pub fn update_chain(attrs: &mut Attributes, action: &str, config: &Config) {
    attrs.merge(&config.extra_attributes);
    attrs.shift_custody_chain();
    attrs.set("custodyChain.0.time", &chrono::Utc::now().to_rfc3339());
    if !action.is_empty() {
        attrs.set("custodyChain.0.action", action);
    }
    if !config.update_chain {
        return;
    }
    if let Some(host) = &config.hostname {
        attrs.set("custodyChain.0.local.hostname", host);
    }
}
