//! 하위 전달 구현
//!
//! - `DirectorySink`: 레코드를 FlowFile 패키지 파일로 저장
//! - `ChannelSink`: 레코드를 채널로 넘김 (임베딩/테스트용)

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::flowfile::{encode_header, Attributes, FlowFile};
use crate::packet::StreamId;
use crate::receiver::FlowFileSink;
use crate::{Error, Result};

/// 출력 디렉토리에 `<uuid>.flowfile`로 저장
///
/// `.part`로 쓴 뒤 완성 이름으로 링크하므로 완성된 파일만 보임.
/// 같은 uuid가 다시 오면 기존 파일을 덮지 않고 번호를 붙임
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_stem(attrs: &Attributes) -> String {
        attrs
            .get("uuid")
            .and_then(StreamId::parse)
            .unwrap_or_else(StreamId::random)
            .to_string()
    }

    /// 같은 uuid 파일이 있으면 `-1`, `-2` ... 를 붙여 완성 파일 이름 확보
    fn claim(&self, part: &Path, stem: &str) -> Result<PathBuf> {
        for n in 0u32.. {
            let name = match n {
                0 => format!("{}.flowfile", stem),
                n => format!("{}-{}.flowfile", stem, n),
            };
            let done = self.dir.join(name);
            match fs::hard_link(part, &done) {
                Ok(()) => return Ok(done),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Sink("출력 파일 이름 고갈".into()))
    }
}

impl FlowFileSink for DirectorySink {
    fn send(&self, attrs: &Attributes, payload: &mut dyn Read, size: u64) -> Result<()> {
        let stem = Self::file_stem(attrs);
        let part = self.dir.join(format!("{}.{}.part", stem, StreamId::random()));

        let mut out = BufWriter::new(File::create(&part)?);
        let mut header = Vec::new();
        encode_header(attrs, size, &mut header);
        out.write_all(&header)?;
        let copied = io::copy(payload, &mut out)?;
        out.flush()?;
        drop(out);

        if copied != size {
            let _ = fs::remove_file(&part);
            return Err(Error::ShortStream {
                expected: size,
                got: copied,
            });
        }

        let result = self.claim(&part, &stem);
        let _ = fs::remove_file(&part);
        let done = result?;
        debug!(path = %done.display(), size, "레코드 저장");
        Ok(())
    }
}

/// 레코드를 메모리로 읽어 채널로 전달
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<FlowFile>,
}

impl ChannelSink {
    /// 무제한 채널로 생성
    pub fn unbounded() -> (Self, Receiver<FlowFile>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    /// 용량 제한 채널 (가득 차면 전달 스레드가 대기)
    pub fn bounded(cap: usize) -> (Self, Receiver<FlowFile>) {
        let (tx, rx) = crossbeam_channel::bounded(cap);
        (Self { tx }, rx)
    }
}

impl FlowFileSink for ChannelSink {
    fn send(&self, attrs: &Attributes, payload: &mut dyn Read, size: u64) -> Result<()> {
        let mut data = Vec::with_capacity(size as usize);
        payload.read_to_end(&mut data)?;
        self.tx
            .send(FlowFile::new(attrs.clone(), Bytes::from(data)))
            .map_err(|_| Error::Sink("채널 수신측 닫힘".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flowfile::ChecksumKind;

    #[test]
    fn test_directory_sink_writes_package() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("out")).unwrap();

        let id = StreamId::random();
        let mut ff = FlowFile::from_file_contents("hello.txt", "./", &b"hello"[..]);
        ff.attrs.set("uuid", &id.to_string());
        ff.add_checksum(ChecksumKind::Sha256);

        sink.send(&ff.attrs, &mut &ff.payload[..], ff.size()).unwrap();

        let path = sink.dir().join(format!("{}.flowfile", id));
        let written = fs::read(&path).unwrap();
        let decoded = FlowFile::decode_all(&written).unwrap();
        assert_eq!(decoded, vec![ff]);
        assert_eq!(fs::read_dir(sink.dir()).unwrap().count(), 1);
    }

    #[test]
    fn test_directory_sink_same_uuid_kept_apart() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path()).unwrap();

        let id = StreamId::random();
        let mut first = FlowFile::from_file_contents("one.txt", "./", &b"first"[..]);
        first.attrs.set("uuid", &id.to_string());
        let mut second = FlowFile::from_file_contents("two.txt", "./", &b"second"[..]);
        second.attrs.set("uuid", &id.to_string());

        sink.send(&first.attrs, &mut &first.payload[..], first.size()).unwrap();
        sink.send(&second.attrs, &mut &second.payload[..], second.size()).unwrap();

        let a = fs::read(dir.path().join(format!("{}.flowfile", id))).unwrap();
        let b = fs::read(dir.path().join(format!("{}-1.flowfile", id))).unwrap();
        assert_eq!(FlowFile::decode_all(&a).unwrap(), vec![first]);
        assert_eq!(FlowFile::decode_all(&b).unwrap(), vec![second]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_directory_sink_short_payload() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path()).unwrap();
        let attrs = Attributes::new();

        let result = sink.send(&attrs, &mut &b"abc"[..], 10);
        assert!(matches!(result, Err(Error::ShortStream { expected: 10, got: 3 })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_channel_sink() {
        let (sink, rx) = ChannelSink::unbounded();
        let mut attrs = Attributes::new();
        attrs.set("filename", "c.bin");

        sink.send(&attrs, &mut &b"payload"[..], 7).unwrap();
        let got = rx.try_recv().unwrap();
        assert_eq!(got.attrs.get("filename"), Some("c.bin"));
        assert_eq!(&got.payload[..], b"payload");

        drop(rx);
        assert!(matches!(
            sink.send(&attrs, &mut &b"x"[..], 1),
            Err(Error::Sink(_))
        ));
    }
}
