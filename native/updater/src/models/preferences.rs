use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ThemeMode {
    Light,
    Dark,
    #[default]
    FollowSystem,
}

impl TryFrom<i64> for ThemeMode {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ThemeMode::Light),
            1 => Ok(ThemeMode::Dark),
            2 => Ok(ThemeMode::FollowSystem),
            other => Err(format!("unknown theme mode {other}")),
        }
    }
}

impl From<ThemeMode> for i64 {
    fn from(mode: ThemeMode) -> Self {
        match mode {
            ThemeMode::Light => 0,
            ThemeMode::Dark => 1,
            ThemeMode::FollowSystem => 2,
        }
    }
}

pub const DEFAULT_REFRESH_INTERVAL_DAYS: u32 = 7;
