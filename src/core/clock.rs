use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

/// 同步判定上限：主从时钟相差超过这个秒数就认为失去同步，直接跳变
pub const AV_NOSYNC_THRESHOLD: f64 = 10.0;

/// 尚未设置过的 serial（与任何队列 serial 都不相等）
pub const SERIAL_UNSET: u64 = u64::MAX;

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// 进程内单调时间（秒）- 所有时钟共用同一个原点
pub fn now_secs() -> f64 {
    CLOCK_ORIGIN
        .get_or_init(Instant::now)
        .elapsed()
        .as_secs_f64()
}

/// 队列当前 serial 的共享快照
///
/// 队列每吞下一个 flush 屏障就把新 serial 写进来，时钟和消费端只读。
/// 用值快照替代了对队列本身的回指，避免循环引用。
#[derive(Clone)]
pub struct SerialRef(Arc<AtomicU64>);

impl SerialRef {
    pub fn new(initial: u64) -> Self {
        Self(Arc::new(AtomicU64::new(initial)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, serial: u64) {
        self.0.store(serial, Ordering::SeqCst);
    }
}

/// 播放时钟 - 音视频同步的基础
///
/// 不记录"当前时间"而是记录 pts 与取样时刻的漂移量，读取时按真实
/// 时间推算，变速时保持连续。当源队列因 seek 换代（serial 不一致），
/// 时钟读数为 NaN，表示当前值不可信。
#[derive(Clone)]
pub struct Clock {
    inner: Arc<Mutex<ClockInner>>,
    queue_serial: SerialRef,
    /// 自走时钟在写入时同步刷新自己的有效性快照
    self_paced: bool,
}

struct ClockInner {
    pts: f64,
    pts_drift: f64,
    last_updated: f64,
    speed: f64,
    serial: u64,
    paused: bool,
}

impl Clock {
    /// 以某个队列的 serial 快照为有效性依据创建时钟
    pub fn new(queue_serial: SerialRef) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockInner {
                pts: f64::NAN,
                pts_drift: f64::NAN,
                last_updated: now_secs(),
                speed: 1.0,
                serial: SERIAL_UNSET,
                paused: false,
            })),
            queue_serial,
            self_paced: false,
        }
    }

    /// 自走时钟（外部时钟用）：有效性依据就是自己的 serial
    pub fn free_running() -> Self {
        let mut clock = Self::new(SerialRef::new(SERIAL_UNSET));
        clock.self_paced = true;
        clock
    }

    /// 当前读数（秒），失效时为 NaN
    pub fn get(&self) -> f64 {
        self.get_at(now_secs())
    }

    /// 指定取样时刻的读数（测试与回放推算用）
    pub fn get_at(&self, time: f64) -> f64 {
        let inner = self.inner.lock();
        if self.queue_serial.get() != inner.serial {
            return f64::NAN;
        }
        if inner.paused {
            inner.pts
        } else {
            inner.pts_drift + time - (time - inner.last_updated) * (1.0 - inner.speed)
        }
    }

    pub fn set(&self, pts: f64, serial: u64) {
        self.set_at(pts, serial, now_secs());
    }

    /// 在明确的时刻写入时钟（音频回调用回调时刻，而非执行时刻）
    pub fn set_at(&self, pts: f64, serial: u64, time: f64) {
        let mut inner = self.inner.lock();
        inner.pts = pts;
        inner.last_updated = time;
        inner.pts_drift = pts - time;
        inner.serial = serial;
        if self.self_paced {
            self.queue_serial.set(serial);
        }
    }

    /// 变速 - 先按旧速度取当前值写回，保证读数连续
    pub fn set_speed(&self, speed: f64) {
        let current = self.get();
        let serial = self.serial();
        self.set(current, serial);
        self.inner.lock().speed = speed;
    }

    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    pub fn serial(&self) -> u64 {
        self.inner.lock().serial
    }

    /// 最近一次写入的 pts 原值（不随时间推算）
    pub fn pts(&self) -> f64 {
        self.inner.lock().pts
    }

    pub fn last_updated(&self) -> f64 {
        self.inner.lock().last_updated
    }

    /// 主时钟失效或漂移过大时，把主时钟对齐到从时钟
    pub fn sync_to_slave(master: &Clock, slave: &Clock) {
        let clock = master.get();
        let slave_clock = slave.get();
        if !slave_clock.is_nan()
            && (clock.is_nan() || (clock - slave_clock).abs() > AV_NOSYNC_THRESHOLD)
        {
            master.set(slave_clock, slave.serial());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_before_first_set() {
        let clock = Clock::new(SerialRef::new(0));
        assert!(clock.get().is_nan());
    }

    #[test]
    fn test_drift_formula_advances_with_time() {
        let serial = SerialRef::new(3);
        let clock = Clock::new(serial);
        clock.set_at(10.0, 3, 100.0);
        assert!((clock.get_at(100.0) - 10.0).abs() < 1e-9);
        assert!((clock.get_at(101.5) - 11.5).abs() < 1e-9);
    }

    #[test]
    fn test_serial_mismatch_is_nan() {
        let serial = SerialRef::new(1);
        let clock = Clock::new(serial.clone());
        clock.set_at(5.0, 1, 50.0);
        assert!(!clock.get_at(50.0).is_nan());
        // 队列换代，时钟读数立刻失效
        serial.set(2);
        assert!(clock.get_at(50.0).is_nan());
    }

    #[test]
    fn test_paused_returns_pts() {
        let clock = Clock::new(SerialRef::new(0));
        clock.set_at(7.0, 0, 10.0);
        clock.set_paused(true);
        assert!((clock.get_at(99.0) - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_speed_is_continuous() {
        let clock = Clock::free_running();
        clock.set(20.0, 0);
        let before = clock.get();
        clock.set_speed(1.5);
        let after = clock.get();
        assert!((after - before).abs() < 1e-3);
        assert!((clock.speed() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_half_speed_half_progress() {
        let clock = Clock::free_running();
        clock.set_at(0.0, 0, 1000.0);
        clock.inner.lock().speed = 0.5;
        // 过了 2 秒，读数只走 1 秒
        assert!((clock.get_at(1002.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_get_roundtrip_is_noop() {
        let clock = Clock::free_running();
        clock.set_at(42.0, 5, 200.0);
        let v1 = clock.get_at(203.0);
        let serial = clock.serial();
        clock.set_at(clock.get_at(203.0), serial, 203.0);
        let v2 = clock.get_at(203.0);
        assert!((v1 - v2).abs() < 1e-9);
    }

    #[test]
    fn test_sync_to_slave_snaps_on_big_drift() {
        let master = Clock::free_running();
        let slave = Clock::free_running();
        master.set_at(0.0, 0, 100.0);
        slave.set_at(100.0, 7, 100.0);
        Clock::sync_to_slave(&master, &slave);
        // 相差超过 10 秒，master 直接跳到 slave
        assert!((master.get_at(100.0) - 100.0).abs() < 0.01);
    }

    #[test]
    fn test_sync_to_slave_keeps_small_drift() {
        let master = Clock::free_running();
        let slave = Clock::free_running();
        master.set_at(10.0, 0, 100.0);
        slave.set_at(10.5, 1, 100.0);
        Clock::sync_to_slave(&master, &slave);
        assert!((master.get_at(100.0) - 10.0).abs() < 0.01);
    }
}
