use std::collections::VecDeque;
use std::mem;
use std::sync::{Condvar, Mutex};

use crate::core::{Packet, PlayerError, Result, SerialRef};

/// 队列条目：数据包按入队时的 serial 打标；flush 屏障是显式变体，
/// 永远不会被送进解码器，只用来通知消费端换代并重置解码状态。
enum Entry {
    Packet { pkt: Packet, serial: u64 },
    Barrier(u64),
}

/// get() 的结果
pub enum Got {
    Packet { pkt: Packet, serial: u64 },
    /// 碰到 flush 屏障，附带新纪元的 serial
    Flush(u64),
    /// 队列已中止
    Aborted,
    /// 非阻塞模式下队列为空
    Empty,
}

struct State {
    entries: VecDeque<Entry>,
    nb_packets: usize,
    size: usize,
    duration: i64,
    serial: u64,
    abort_request: bool,
}

/// 数据包队列 - 解封装线程与解码线程之间的带 serial 的 FIFO
///
/// 容量不设上限，读端靠 reader 的水位判断背压。serial 在每次入队
/// flush 屏障时 +1，消费端拿包时对比 serial 即可识别 seek 前的旧包。
pub struct PacketQueue {
    state: Mutex<State>,
    cond: Condvar,
    serial_ref: SerialRef,
}

/// 统计 size 时每个包额外计入的固定开销（对齐结构体自身大小）
const PACKET_OVERHEAD: usize = mem::size_of::<Packet>();

impl PacketQueue {
    /// 新队列处于中止状态，start() 之后才接受数据
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0,
                serial: 0,
                abort_request: true,
            }),
            cond: Condvar::new(),
            serial_ref: SerialRef::new(0),
        }
    }

    /// 入队一个数据包并唤醒一个等待者；中止状态下拒绝
    pub fn put(&self, pkt: Packet) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.abort_request {
            return Err(PlayerError::Aborted);
        }
        st.nb_packets += 1;
        st.size += pkt.size() + PACKET_OVERHEAD;
        st.duration += pkt.duration;
        let serial = st.serial;
        st.entries.push_back(Entry::Packet { pkt, serial });
        self.cond.notify_one();
        Ok(())
    }

    /// 入队 flush 屏障：serial 先 +1，屏障携带新 serial
    pub fn put_barrier(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.abort_request {
            return Err(PlayerError::Aborted);
        }
        st.serial += 1;
        self.serial_ref.set(st.serial);
        let serial = st.serial;
        st.entries.push_back(Entry::Barrier(serial));
        self.cond.notify_one();
        Ok(())
    }

    /// 取队头。block 为真时等到有数据或被中止为止
    pub fn get(&self, block: bool) -> Got {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.abort_request {
                return Got::Aborted;
            }
            match st.entries.pop_front() {
                Some(Entry::Packet { pkt, serial }) => {
                    st.nb_packets -= 1;
                    st.size -= pkt.size() + PACKET_OVERHEAD;
                    st.duration -= pkt.duration;
                    return Got::Packet { pkt, serial };
                }
                Some(Entry::Barrier(serial)) => {
                    return Got::Flush(serial);
                }
                None => {
                    if !block {
                        return Got::Empty;
                    }
                    st = self.cond.wait(st).unwrap();
                }
            }
        }
    }

    /// 丢弃所有排队内容并清零计数，serial 不变
    pub fn flush(&self) {
        let mut st = self.state.lock().unwrap();
        st.entries.clear();
        st.nb_packets = 0;
        st.size = 0;
        st.duration = 0;
    }

    /// 解除中止并入队一个屏障，开启新纪元
    pub fn start(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.abort_request = false;
            st.serial += 1;
            self.serial_ref.set(st.serial);
            let serial = st.serial;
            st.entries.push_back(Entry::Barrier(serial));
        }
        self.cond.notify_one();
    }

    /// 中止队列，唤醒所有阻塞的读端
    pub fn abort(&self) {
        {
            let mut st = self.state.lock().unwrap();
            st.abort_request = true;
        }
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().abort_request
    }

    pub fn nb_packets(&self) -> usize {
        self.state.lock().unwrap().nb_packets
    }

    /// 排队字节总量（含固定开销）
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().size
    }

    /// 排队时长合计（流 time_base 单位）
    pub fn duration(&self) -> i64 {
        self.state.lock().unwrap().duration
    }

    /// 当前纪元
    pub fn serial(&self) -> u64 {
        self.serial_ref.get()
    }

    /// serial 的共享快照（时钟与消费端持有）
    pub fn serial_ref(&self) -> SerialRef {
        self.serial_ref.clone()
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pkt(bytes: usize, duration: i64) -> Packet {
        Packet {
            data: vec![0u8; bytes],
            stream_index: 0,
            pts: None,
            dts: None,
            duration,
            pos: -1,
            keyframe: false,
        }
    }

    #[test]
    fn test_put_rejected_before_start() {
        let q = PacketQueue::new();
        assert!(q.put(pkt(10, 0)).is_err());
    }

    #[test]
    fn test_counters_track_puts_and_gets() {
        let q = PacketQueue::new();
        q.start();
        q.put(pkt(100, 10)).unwrap();
        q.put(pkt(50, 5)).unwrap();
        assert_eq!(q.nb_packets(), 2);
        assert_eq!(q.size(), 150 + 2 * PACKET_OVERHEAD);
        assert_eq!(q.duration(), 15);

        // 先吃掉 start() 的屏障
        assert!(matches!(q.get(true), Got::Flush(_)));
        assert!(matches!(q.get(true), Got::Packet { .. }));
        assert!(matches!(q.get(true), Got::Packet { .. }));
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.size(), 0);
        assert_eq!(q.duration(), 0);
    }

    #[test]
    fn test_roundtrip_preserves_packet_and_serial() {
        let q = PacketQueue::new();
        q.start();
        let serial_now = q.serial();
        let mut p = pkt(8, 3);
        p.pts = Some(1234);
        p.pos = 77;
        q.put(p).unwrap();
        assert!(matches!(q.get(true), Got::Flush(_)));
        match q.get(true) {
            Got::Packet { pkt, serial } => {
                assert_eq!(pkt.pts, Some(1234));
                assert_eq!(pkt.pos, 77);
                assert_eq!(pkt.size(), 8);
                assert_eq!(serial, serial_now);
            }
            _ => panic!("应当取到数据包"),
        }
    }

    #[test]
    fn test_barrier_bumps_serial_and_tags_later_packets() {
        let q = PacketQueue::new();
        q.start();
        let before = q.serial();
        q.put(pkt(1, 0)).unwrap();
        q.put_barrier().unwrap();
        q.put(pkt(2, 0)).unwrap();
        assert_eq!(q.serial(), before + 1);

        assert!(matches!(q.get(true), Got::Flush(s) if s == before));
        match q.get(true) {
            Got::Packet { serial, .. } => assert_eq!(serial, before),
            _ => panic!(),
        }
        assert!(matches!(q.get(true), Got::Flush(s) if s == before + 1));
        match q.get(true) {
            Got::Packet { serial, .. } => assert_eq!(serial, before + 1),
            _ => panic!(),
        }
    }

    #[test]
    fn test_flush_drops_packets_keeps_serial() {
        let q = PacketQueue::new();
        q.start();
        q.put(pkt(10, 1)).unwrap();
        q.put(pkt(10, 1)).unwrap();
        let serial = q.serial();
        q.flush();
        assert_eq!(q.nb_packets(), 0);
        assert_eq!(q.size(), 0);
        assert_eq!(q.serial(), serial);
        assert!(matches!(q.get(false), Got::Empty));
    }

    #[test]
    fn test_nonblocking_get_on_empty() {
        let q = PacketQueue::new();
        q.start();
        assert!(matches!(q.get(true), Got::Flush(_)));
        assert!(matches!(q.get(false), Got::Empty));
    }

    #[test]
    fn test_abort_wakes_blocked_getter() {
        let q = Arc::new(PacketQueue::new());
        q.start();
        assert!(matches!(q.get(true), Got::Flush(_)));

        let q2 = q.clone();
        let handle = thread::spawn(move || matches!(q2.get(true), Got::Aborted));
        thread::sleep(Duration::from_millis(50));
        q.abort();
        assert!(handle.join().unwrap());
    }
}
