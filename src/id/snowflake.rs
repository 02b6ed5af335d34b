//! # Snowflake ID 生成器
//!
//! 64 位 ID 布局：
//!
//! ```text
//! | 1 bit 符号位 | 41 bit 毫秒偏移 | 10 bit 机器 ID | 12 bit 序列号 |
//! ```
//!
//! - 毫秒偏移以 [`EPOCH_MILLIS`]（2024-01-01T00:00:00Z）为起点
//! - 同一毫秒内序列号递增，溢出后等待下一毫秒
//! - 时钟回拨属于致命错误：[`SnowflakeGenerator::generate`] 直接 panic，
//!   release 构建下 `panic = "abort"` 使进程退出
//!
//! 生成器需要显式构造并注入使用方，不提供全局单例。

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::error;

/// 自定义纪元：2024-01-01T00:00:00Z（Unix 毫秒）
pub const EPOCH_MILLIS: i64 = 1_704_067_200_000;

const TIMESTAMP_BITS: u8 = 41;
const MACHINE_ID_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;

const MACHINE_ID_SHIFT: u8 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u8 = SEQUENCE_BITS + MACHINE_ID_BITS;

/// 机器 ID 上限（含）
pub const MAX_MACHINE_ID: u16 = (1 << MACHINE_ID_BITS) - 1;
const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP_OFFSET: i64 = (1 << TIMESTAMP_BITS) - 1;

/// 序列号耗尽后等待下一毫秒的最长时间
const DEFAULT_SPIN_LIMIT: Duration = Duration::from_millis(5);

/// 时间源
///
/// 返回 Unix 毫秒时间戳。生产环境使用 [`SystemClock`]，测试中使用 [`ManualClock`]。
pub trait TimeSource: Send + Sync {
    fn current_millis(&self) -> i64;
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn current_millis(&self) -> i64 {
        crate::utils::current_millis()
    }
}

/// 手动推进的时钟，克隆体共享同一时间值
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(millis)),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn current_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Snowflake 生成错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnowflakeError {
    #[error("machine id {0} out of range (0-{max})", max = MAX_MACHINE_ID)]
    InvalidMachineId(u16),
    #[error("clock moved backwards: last={last_millis}ms, now={now_millis}ms")]
    ClockMovedBackwards { last_millis: i64, now_millis: i64 },
    #[error("sequence exhausted within {last_millis}ms and the clock did not advance")]
    SequenceExhausted { last_millis: i64 },
    #[error("timestamp {now_millis}ms is outside the representable range")]
    TimestampOverflow { now_millis: i64 },
}

/// 解析后的 ID 组成部分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedId {
    /// Unix 毫秒时间戳
    pub timestamp_millis: i64,
    pub machine_id: u16,
    pub sequence: u16,
}

#[derive(Debug)]
struct State {
    last_timestamp: i64,
    sequence: i64,
}

/// Snowflake ID 生成器
pub struct SnowflakeGenerator<T: TimeSource = SystemClock> {
    machine_id: u16,
    clock: T,
    spin_limit: Duration,
    state: Mutex<State>,
}

impl SnowflakeGenerator<SystemClock> {
    /// 使用系统时钟创建生成器
    pub fn new(machine_id: u16) -> Result<Self, SnowflakeError> {
        Self::with_clock(machine_id, SystemClock)
    }
}

impl<T: TimeSource> SnowflakeGenerator<T> {
    /// 使用指定时间源创建生成器
    pub fn with_clock(machine_id: u16, clock: T) -> Result<Self, SnowflakeError> {
        if machine_id > MAX_MACHINE_ID {
            return Err(SnowflakeError::InvalidMachineId(machine_id));
        }
        Ok(Self {
            machine_id,
            clock,
            spin_limit: DEFAULT_SPIN_LIMIT,
            state: Mutex::new(State {
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    pub fn with_spin_limit(mut self, spin_limit: Duration) -> Self {
        self.spin_limit = spin_limit;
        self
    }

    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    /// 生成下一个 ID
    ///
    /// # Panics
    ///
    /// 时钟回拨、序列号耗尽且时钟停滞、时间戳越界时 panic。
    pub fn generate(&self) -> i64 {
        match self.try_generate() {
            Ok(id) => id,
            Err(err) => {
                error!(machine_id = self.machine_id, error = %err, "snowflake generator invariant violated");
                panic!("snowflake generator failed: {err}");
            }
        }
    }

    /// 生成下一个 ID，失败时返回错误而不是 panic
    pub fn try_generate(&self) -> Result<i64, SnowflakeError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mut now = self.clock.current_millis();
        if now < state.last_timestamp {
            return Err(SnowflakeError::ClockMovedBackwards {
                last_millis: state.last_timestamp,
                now_millis: now,
            });
        }

        let sequence = if now == state.last_timestamp {
            let next = (state.sequence + 1) & MAX_SEQUENCE;
            if next == 0 {
                now = self.wait_next_millis(state.last_timestamp)?;
            }
            next
        } else {
            0
        };

        let offset = now - EPOCH_MILLIS;
        if !(0..=MAX_TIMESTAMP_OFFSET).contains(&offset) {
            return Err(SnowflakeError::TimestampOverflow { now_millis: now });
        }

        state.last_timestamp = now;
        state.sequence = sequence;

        Ok((offset << TIMESTAMP_SHIFT)
            | (i64::from(self.machine_id) << MACHINE_ID_SHIFT)
            | sequence)
    }

    /// 拆解 ID
    pub fn parse_id(&self, id: i64) -> ParsedId {
        parse_id(id)
    }

    fn wait_next_millis(&self, last: i64) -> Result<i64, SnowflakeError> {
        let started = Instant::now();
        loop {
            let now = self.clock.current_millis();
            if now > last {
                return Ok(now);
            }
            if now < last {
                return Err(SnowflakeError::ClockMovedBackwards {
                    last_millis: last,
                    now_millis: now,
                });
            }
            if started.elapsed() >= self.spin_limit {
                return Err(SnowflakeError::SequenceExhausted { last_millis: last });
            }
            std::hint::spin_loop();
        }
    }
}

impl<T: TimeSource> fmt::Debug for SnowflakeGenerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeGenerator")
            .field("machine_id", &self.machine_id)
            .finish()
    }
}

/// 拆解 ID 为 (Unix 毫秒时间戳, 机器 ID, 序列号)
pub fn parse_id(id: i64) -> ParsedId {
    ParsedId {
        timestamp_millis: (id >> TIMESTAMP_SHIFT) + EPOCH_MILLIS,
        machine_id: ((id >> MACHINE_ID_SHIFT) & i64::from(MAX_MACHINE_ID)) as u16,
        sequence: (id & MAX_SEQUENCE) as u16,
    }
}
