//! 청크 수신 비트맵
//!
//! 청크당 1비트. 한 번 세운 비트는 내리지 않음

/// 수신 청크 비트맵
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    total: u64,
    received: u64,
}

impl ChunkBitmap {
    /// `total`개 청크용 비트맵 생성
    pub fn new(total: u64) -> Self {
        Self {
            words: vec![0u64; total.div_ceil(64) as usize],
            total,
            received: 0,
        }
    }

    /// 비트 설정. 새로 받은 청크면 true, 중복이거나 범위 밖이면 false
    #[inline]
    pub fn set(&mut self, idx: u64) -> bool {
        if idx >= self.total {
            return false;
        }
        let word = (idx / 64) as usize;
        let mask = 1u64 << (idx % 64);
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.received += 1;
        true
    }

    #[inline]
    pub fn get(&self, idx: u64) -> bool {
        if idx >= self.total {
            return false;
        }
        self.words[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
    }

    /// 모든 청크 수신 여부
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }

    #[inline]
    pub fn received(&self) -> u64 {
        self.received
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// 누락된 청크 인덱스 (로그용)
    pub fn missing(&self) -> Vec<u64> {
        (0..self.total).filter(|&i| !self.get(i)).collect()
    }

    /// 비트별 0/1 벡터
    pub fn to_vec(&self) -> Vec<u8> {
        (0..self.total).map(|i| self.get(i) as u8).collect()
    }
}
