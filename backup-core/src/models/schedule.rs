use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// 重复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recurrence {
    #[default]
    None,
    Manual,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recurrence::None => "none",
            Recurrence::Manual => "manual",
            Recurrence::Hourly => "hourly",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }
}

/// 任务调度配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub recurrence: Recurrence,
    /// Daily / Weekly / Monthly 的触发时刻
    #[serde(default = "midnight")]
    pub time: NaiveTime,
    /// Weekly 的触发星期
    #[serde(default = "default_weekday")]
    pub weekday: Weekday,
    /// 保存用户填写的日期；Monthly 目前固定在下月 1 日触发，不使用该值
    #[serde(default)]
    pub day_of_month: Option<u32>,
}

fn midnight() -> NaiveTime {
    NaiveTime::MIN
}

fn default_weekday() -> Weekday {
    Weekday::Mon
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            recurrence: Recurrence::None,
            time: midnight(),
            weekday: default_weekday(),
            day_of_month: None,
        }
    }
}

impl Schedule {
    pub fn manual() -> Self {
        Self {
            recurrence: Recurrence::Manual,
            ..Self::default()
        }
    }

    pub fn hourly() -> Self {
        Self {
            recurrence: Recurrence::Hourly,
            ..Self::default()
        }
    }

    pub fn daily(time: NaiveTime) -> Self {
        Self {
            recurrence: Recurrence::Daily,
            time,
            ..Self::default()
        }
    }

    pub fn weekly(weekday: Weekday, time: NaiveTime) -> Self {
        Self {
            recurrence: Recurrence::Weekly,
            time,
            weekday,
            day_of_month: None,
        }
    }

    pub fn monthly(time: NaiveTime) -> Self {
        Self {
            recurrence: Recurrence::Monthly,
            time,
            ..Self::default()
        }
    }

    /// 是否参与定时调度
    pub fn is_schedulable(&self) -> bool {
        !matches!(self.recurrence, Recurrence::None | Recurrence::Manual)
    }
}
