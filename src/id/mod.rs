//! ID 生成模块

pub mod snowflake;

pub use snowflake::{
    MAX_MACHINE_ID, ManualClock, ParsedId, SnowflakeError, SnowflakeGenerator, SystemClock,
    TimeSource, parse_id,
};
