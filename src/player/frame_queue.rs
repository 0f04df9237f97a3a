use std::sync::{Arc, Condvar, Mutex};

use crate::core::{AudioFrame, SubtitleFrame, VideoFrame};
use crate::player::packet_queue::PacketQueue;

/// 视频帧环大小：够调度器做一帧超前判断即可
pub const VIDEO_PICTURE_QUEUE_SIZE: usize = 3;
pub const SUBPICTURE_QUEUE_SIZE: usize = 16;
pub const SAMPLE_QUEUE_SIZE: usize = 9;

/// 能进帧队列的类型：必须携带产生它的包的 serial
pub trait Queued: Send + Sync {
    fn serial(&self) -> u64;
    /// 来源字节偏移（按字节 seek 用），未知为 -1
    fn pos(&self) -> i64 {
        -1
    }
}

impl Queued for VideoFrame {
    fn serial(&self) -> u64 {
        self.serial
    }
    fn pos(&self) -> i64 {
        self.pos
    }
}

impl Queued for AudioFrame {
    fn serial(&self) -> u64 {
        self.serial
    }
    fn pos(&self) -> i64 {
        self.pos
    }
}

impl Queued for SubtitleFrame {
    fn serial(&self) -> u64 {
        self.serial
    }
}

struct Ring<T> {
    slots: Vec<Option<Arc<T>>>,
    rindex: usize,
    windex: usize,
    size: usize,
    rindex_shown: usize,
}

/// 解码帧环形队列
///
/// 固定容量，写端满了阻塞、读端空了阻塞，两端都被所属数据包队列的
/// 中止唤醒。keep_last 打开时，刚展示过的帧在逻辑上已被消费、但仍
/// 可通过 peek_last 取到，供调度器计算上一帧到当前帧的名义时长。
pub struct FrameQueue<T: Queued> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    pktq: Arc<PacketQueue>,
    max_size: usize,
    keep_last: bool,
}

impl<T: Queued> FrameQueue<T> {
    pub fn new(pktq: Arc<PacketQueue>, max_size: usize, keep_last: bool) -> Self {
        let mut slots = Vec::with_capacity(max_size);
        slots.resize_with(max_size, || None);
        Self {
            ring: Mutex::new(Ring {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
            }),
            cond: Condvar::new(),
            pktq,
            max_size,
            keep_last,
        }
    }

    /// 等待写入位。中止返回 false
    pub fn peek_writable(&self) -> bool {
        let mut ring = self.ring.lock().unwrap();
        while ring.size >= self.max_size && !self.pktq.is_aborted() {
            ring = self.cond.wait(ring).unwrap();
        }
        !self.pktq.is_aborted()
    }

    /// 提交一帧到 windex 并前移（须先用 peek_writable 确认有空位）
    pub fn push(&self, frame: T) {
        let mut ring = self.ring.lock().unwrap();
        debug_assert!(ring.size < self.max_size);
        let windex = ring.windex;
        ring.slots[windex] = Some(Arc::new(frame));
        ring.windex = (ring.windex + 1) % self.max_size;
        ring.size += 1;
        self.cond.notify_all();
    }

    /// 等待可读帧。中止返回 None
    pub fn peek_readable(&self) -> Option<Arc<T>> {
        let mut ring = self.ring.lock().unwrap();
        while ring.size <= ring.rindex_shown && !self.pktq.is_aborted() {
            ring = self.cond.wait(ring).unwrap();
        }
        if self.pktq.is_aborted() {
            return None;
        }
        let idx = (ring.rindex + ring.rindex_shown) % self.max_size;
        ring.slots[idx].clone()
    }

    /// 非阻塞读当前帧
    pub fn peek(&self) -> Option<Arc<T>> {
        let ring = self.ring.lock().unwrap();
        if ring.size - ring.rindex_shown == 0 {
            return None;
        }
        ring.slots[(ring.rindex + ring.rindex_shown) % self.max_size].clone()
    }

    /// 非阻塞读当前帧的下一帧
    pub fn peek_next(&self) -> Option<Arc<T>> {
        let ring = self.ring.lock().unwrap();
        if ring.size < ring.rindex_shown + 2 {
            return None;
        }
        ring.slots[(ring.rindex + ring.rindex_shown + 1) % self.max_size].clone()
    }

    /// 刚展示过的帧：仅在 keep_last 且已经翻过 rindex_shown 时有效
    pub fn peek_last(&self) -> Option<Arc<T>> {
        let ring = self.ring.lock().unwrap();
        ring.slots[ring.rindex].clone()
    }

    /// 消费当前帧
    ///
    /// keep_last 第一次调用只翻 rindex_shown，让帧多活一步。
    pub fn next(&self) {
        let mut ring = self.ring.lock().unwrap();
        if self.keep_last && ring.rindex_shown == 0 {
            ring.rindex_shown = 1;
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (ring.rindex + 1) % self.max_size;
        ring.size -= 1;
        self.cond.notify_all();
    }

    /// 可读帧数（不含逻辑上已消费的 keep_last 帧）
    pub fn nb_remaining(&self) -> usize {
        let ring = self.ring.lock().unwrap();
        ring.size - ring.rindex_shown
    }

    /// 最后展示帧的来源字节偏移；serial 换代后无效
    pub fn last_pos(&self) -> Option<i64> {
        let ring = self.ring.lock().unwrap();
        if ring.rindex_shown == 0 {
            return None;
        }
        match &ring.slots[ring.rindex] {
            Some(frame) if frame.serial() == self.pktq.serial() => Some(frame.pos()),
            _ => None,
        }
    }

    /// 是否已经有帧展示过（keep_last 翻转之后为真）
    pub fn rindex_shown(&self) -> bool {
        self.ring.lock().unwrap().rindex_shown == 1
    }

    /// 中止后唤醒两端
    pub fn signal(&self) {
        let _ring = self.ring.lock().unwrap();
        self.cond.notify_all();
    }
}
