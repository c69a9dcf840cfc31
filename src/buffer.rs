//! 메모리/디스크 하이브리드 버퍼
//!
//! 최근 쓰기는 메모리 윈도우에 두고, 스트림 앞쪽부터 연속된 바이트가
//! 생기면 임시 파일로 내보내면서 `ContiguousSink`에 전달함.
//! 순서가 크게 어긋나 윈도우를 넘는 쓰기가 오면 직접 쓰기 모드로 영구 전환
//!
//! ```text
//!  file (flushed)       window (memory)
//! [0 ........ base)[base ........ base+capacity)
//!                   ^ 연속 구간이 생기면 flush → sink
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::warn;

use crate::Result;

/// 스트림 앞에서부터 연속이 된 바이트를 받는 인터페이스
///
/// 같은 오프셋에 대해 최대 한 번, 오프셋 증가 순으로 호출됨
pub trait ContiguousSink {
    fn on_contiguous_bytes(&mut self, offset: u64, data: &[u8]);
}

/// 아무것도 하지 않는 sink
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl ContiguousSink for Discard {
    fn on_contiguous_bytes(&mut self, _offset: u64, _data: &[u8]) {}
}

/// 메모리 윈도우
#[derive(Debug)]
pub struct Window {
    /// 윈도우 시작 오프셋 (이전은 모두 파일에 있음)
    base: u64,

    /// 윈도우 데이터 (고정 크기)
    data: Vec<u8>,

    /// 채워진 구간 (절대 오프셋 start → end)
    filled: BTreeMap<u64, u64>,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            base: 0,
            data: vec![0u8; capacity],
            filled: BTreeMap::new(),
        }
    }

    fn limit(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    fn store(&mut self, offset: u64, bytes: &[u8]) {
        let start = (offset - self.base) as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.mark(offset, offset + bytes.len() as u64);
    }

    /// 구간 추가 (겹치거나 맞닿은 구간은 병합)
    fn mark(&mut self, mut start: u64, mut end: u64) {
        if let Some((&s, &e)) = self.filled.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.filled.remove(&s);
            }
        }
        while let Some((&s, &e)) = self.filled.range(start..).next() {
            if s > end {
                break;
            }
            end = end.max(e);
            self.filled.remove(&s);
        }
        self.filled.insert(start, end);
    }

    /// base부터 연속으로 채워진 길이
    fn contiguous(&self) -> usize {
        match self.filled.first_key_value() {
            Some((&s, &e)) if s == self.base => (e - s) as usize,
            _ => 0,
        }
    }

    /// 첫 구간(길이 n)을 내보낸 뒤 윈도우 이동
    fn advance(&mut self, n: usize) {
        self.filled.remove(&self.base);
        self.data.copy_within(n.., 0);
        let cap = self.data.len();
        self.data[cap - n..].fill(0);
        self.base += n as u64;
    }

    fn clear(&mut self) {
        self.base = 0;
        self.data.fill(0);
        self.filled.clear();
    }
}

/// 버퍼 모드. `Buffered` → `Direct` 전환만 가능
#[derive(Debug)]
pub enum BufferMode {
    /// 메모리 윈도우 경유, 연속 구간은 sink로 스트리밍
    Buffered(Window),

    /// 파일에 바로 위치 쓰기 (sink 호출 없음)
    Direct,
}

/// 위치 기반 하이브리드 버퍼
pub struct HybridBuffer<S = Discard> {
    file: NamedTempFile,
    window_size: usize,
    mode: BufferMode,
    /// 지금까지 쓴 가장 먼 끝 오프셋
    len: u64,
    sink: S,
    #[cfg(test)]
    fail_next_flush: bool,
}

impl<S: ContiguousSink> HybridBuffer<S> {
    /// `dir`에 임시 파일을 만들어 버퍼 생성. 버퍼를 drop하면 파일 삭제
    pub fn new(dir: impl AsRef<Path>, window_size: usize, sink: S) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("ffudp-")
            .suffix(".part")
            .tempfile_in(dir)?;

        Ok(Self {
            file,
            window_size: window_size.max(1),
            mode: BufferMode::Buffered(Window::new(window_size.max(1))),
            len: 0,
            sink,
            #[cfg(test)]
            fail_next_flush: false,
        })
    }

    /// 백업 임시 파일 경로
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> &BufferMode {
        &self.mode
    }

    pub fn is_direct(&self) -> bool {
        matches!(self.mode, BufferMode::Direct)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    fn window_limit(&self) -> u64 {
        match &self.mode {
            BufferMode::Buffered(w) => w.limit(),
            BufferMode::Direct => u64::MAX,
        }
    }

    /// 위치 쓰기
    ///
    /// 윈도우 앞(이미 내보낸 구간)은 파일에 바로 쓰고, 윈도우를 넘으면
    /// 연속 구간을 내보낸 뒤 다시 나눔. 그래도 넘으면 직접 쓰기로 전환
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.len = self.len.max(offset + data.len() as u64);
        if self.is_direct() {
            write_file(self.file.as_file_mut(), offset, data)?;
            return Ok(());
        }

        let (mut offset, mut data) = self.spill_below_base(offset, data)?;
        if data.is_empty() {
            return Ok(());
        }

        if offset + data.len() as u64 > self.window_limit() {
            self.flush_or_fall_back()?;
            (offset, data) = self.spill_below_base(offset, data)?;
            if data.is_empty() {
                return Ok(());
            }
        }
        if offset + data.len() as u64 > self.window_limit() {
            self.fall_back_to_direct()?;
        }

        match &mut self.mode {
            BufferMode::Buffered(w) => w.store(offset, data),
            BufferMode::Direct => write_file(self.file.as_file_mut(), offset, data)?,
        }
        Ok(())
    }

    /// 윈도우 base보다 앞쪽은 파일에 직접 쓰고 나머지 반환
    fn spill_below_base<'d>(&mut self, offset: u64, data: &'d [u8]) -> Result<(u64, &'d [u8])> {
        let base = match &self.mode {
            BufferMode::Buffered(w) if offset < w.base => w.base,
            _ => return Ok((offset, data)),
        };
        let below = ((base - offset) as usize).min(data.len());
        write_file(self.file.as_file_mut(), offset, &data[..below])?;
        Ok((offset + below as u64, &data[below..]))
    }

    /// 연속 구간 flush. 파일 쓰기가 실패하면 직접 쓰기로 전환해서 계속
    fn flush_or_fall_back(&mut self) -> Result<()> {
        if let Err(e) = self.flush_contiguous() {
            warn!(path = %self.file.path().display(), "윈도우 flush 실패: {}", e);
            self.fall_back_to_direct()?;
        }
        Ok(())
    }

    /// 끝에 이어 쓰기
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.write_at(self.len, data)
    }

    /// base부터 연속된 구간을 파일로 내보내고 sink 호출
    fn flush_contiguous(&mut self) -> Result<usize> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_flush) {
            return Err(io::Error::new(io::ErrorKind::Other, "flush 실패 주입").into());
        }
        let BufferMode::Buffered(w) = &mut self.mode else {
            return Ok(0);
        };
        let n = w.contiguous();
        if n == 0 {
            return Ok(0);
        }
        write_file(self.file.as_file_mut(), w.base, &w.data[..n])?;
        self.sink.on_contiguous_bytes(w.base, &w.data[..n]);
        w.advance(n);
        Ok(n)
    }

    /// 윈도우 내용을 모두 파일에 쓰고 직접 쓰기 모드로 전환
    fn fall_back_to_direct(&mut self) -> Result<()> {
        let previous = std::mem::replace(&mut self.mode, BufferMode::Direct);
        if let BufferMode::Buffered(w) = previous {
            for (&s, &e) in &w.filled {
                let start = (s - w.base) as usize;
                let end = start + (e - s) as usize;
                write_file(self.file.as_file_mut(), s, &w.data[start..end])?;
            }
            warn!(
                path = %self.file.path().display(),
                flushed = w.base,
                "버퍼 윈도우 사용 불가, 직접 쓰기 모드로 전환"
            );
        }
        Ok(())
    }

    /// 모든 데이터를 파일로 내보냄
    ///
    /// 모든 바이트가 sink를 거쳤으면 true. 구멍이 남았거나 직접 쓰기
    /// 모드였으면 false (이 경우 검증은 파일을 다시 읽어야 함)
    pub fn flush_all(&mut self) -> Result<bool> {
        self.flush_or_fall_back()?;
        let streamed = match &self.mode {
            BufferMode::Buffered(w) => w.filled.is_empty() && w.base == self.len,
            BufferMode::Direct => false,
        };
        if !streamed && !self.is_direct() {
            self.fall_back_to_direct()?;
        }
        self.file.as_file_mut().flush()?;
        Ok(streamed)
    }

    /// 위치 읽기. 쓴 길이를 넘는 부분은 읽지 않음
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let n = ((self.len - offset) as usize).min(buf.len());
        let buf = &mut buf[..n];

        match &self.mode {
            BufferMode::Direct => read_file(self.file.as_file_mut(), offset, buf)?,
            BufferMode::Buffered(w) => {
                let split = if offset >= w.base {
                    0
                } else {
                    ((w.base - offset) as usize).min(n)
                };
                if split > 0 {
                    read_file(self.file.as_file_mut(), offset, &mut buf[..split])?;
                }
                if split < n {
                    let start = (offset + split as u64 - w.base) as usize;
                    buf[split..].copy_from_slice(&w.data[start..start + (n - split)]);
                }
            }
        }
        Ok(n)
    }

    /// 처음부터 읽는 리더
    pub fn reader(&mut self) -> BufferReader<'_, S> {
        BufferReader {
            buffer: self,
            pos: 0,
        }
    }

    /// 재사용을 위해 비움 (버퍼 모드로 복귀)
    pub fn reset(&mut self) -> Result<()> {
        self.file.as_file_mut().set_len(0)?;
        if self.is_direct() {
            self.mode = BufferMode::Buffered(Window::new(self.window_size));
        } else if let BufferMode::Buffered(w) = &mut self.mode {
            w.clear();
        }
        self.len = 0;
        Ok(())
    }
}

/// `HybridBuffer` 순차 리더
pub struct BufferReader<'a, S> {
    buffer: &'a mut HybridBuffer<S>,
    pos: u64,
}

impl<S: ContiguousSink> Read for BufferReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .buffer
            .read_at(self.pos, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<S: ContiguousSink> Seek for BufferReader<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.buffer.len().checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        self.pos = next.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start")
        })?;
        Ok(self.pos)
    }
}

fn write_file(file: &mut File, offset: u64, data: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)
}

/// 파일 끝을 넘는 부분(구멍)은 0으로 채움
fn read_file(file: &mut File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..])? {
            0 => {
                buf[read..].fill(0);
                break;
            }
            n => read += n,
        }
    }
    Ok(())
}
