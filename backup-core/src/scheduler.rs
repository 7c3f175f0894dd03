//! 定时调度
//!
//! 按固定间隔轮询已启用任务，到期的任务交给 [`BackupCoordinator::run`]，
//! 随后重新计算并保存下一次运行时间。

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::coordinator::BackupCoordinator;
use crate::error::{BackupError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::models::{BackupTask, Recurrence, Schedule};
use crate::store::TaskStore;
use chrono::{
    DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc,
};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 计算下一次运行时间
///
/// 每日和每周取严格晚于 `now` 的下一个时刻；每月固定为下个月 1 日的配置时间，
/// 不使用 `day_of_month`。手动和未设置返回 None。
pub fn next_run<Tz: TimeZone>(schedule: &Schedule, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let tz = now.timezone();
    let today = now.date_naive();

    let next = match schedule.recurrence {
        Recurrence::None | Recurrence::Manual => return None,
        Recurrence::Hourly => now.clone() + Duration::hours(1),
        Recurrence::Daily => {
            let candidate = at_local(&tz, today.and_time(schedule.time))?;
            if candidate > *now {
                candidate
            } else {
                at_local(&tz, (today + Duration::days(1)).and_time(schedule.time))?
            }
        }
        Recurrence::Weekly => {
            let target = schedule.weekday.num_days_from_monday() as i64;
            let current = now.weekday().num_days_from_monday() as i64;
            let days_ahead = (target - current).rem_euclid(7);
            let candidate = at_local(
                &tz,
                (today + Duration::days(days_ahead)).and_time(schedule.time),
            )?;
            if candidate > *now {
                candidate
            } else {
                at_local(
                    &tz,
                    (today + Duration::days(days_ahead + 7)).and_time(schedule.time),
                )?
            }
        }
        Recurrence::Monthly => {
            let (year, month) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            let first = NaiveDate::from_ymd_opt(year, month, 1)?;
            at_local(&tz, first.and_time(schedule.time))?
        }
    };

    Some(next.with_timezone(&Utc))
}

/// 以本地时区计算
pub fn next_run_local(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_run(schedule, &now.with_timezone(&Local))
}

// 夏令时跳过的时刻顺延一小时
fn at_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
}

/// 任务在 `now` 时是否到期
pub fn is_due(task: &BackupTask, now: DateTime<Utc>) -> bool {
    task.is_scheduled() && task.next_run.is_some_and(|next| next <= now)
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    backups: BackupCoordinator,
    events: EventBus,
    clock: Arc<dyn Clock>,
    interval: std::time::Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    pub fn new(backups: BackupCoordinator, interval: std::time::Duration) -> Self {
        let services = backups.services().clone();
        Self {
            store: services.store,
            events: services.events,
            clock: services.clock,
            backups,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn from_config(backups: BackupCoordinator, config: &SchedulerConfig) -> Self {
        Self::new(backups, std::time::Duration::from_secs(config.poll_interval_secs))
    }

    /// 为缺少下一次运行时间的任务补齐，已不参与调度的任务清空
    pub async fn initialize(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut updated = 0;
        for task in self.store.list_tasks().await? {
            let next = if task.is_scheduled() {
                match task.next_run {
                    Some(existing) => Some(existing),
                    None => next_run_local(&task.schedule, now),
                }
            } else {
                None
            };
            if next != task.next_run {
                self.store.update_task_next_run(task.id, next).await?;
                self.events.publish(CoreEvent::TaskScheduled {
                    task_id: task.id,
                    next_run: next,
                });
                updated += 1;
            }
        }
        info!("调度器初始化完成，更新了 {} 个任务的下一次运行时间", updated);
        Ok(updated)
    }

    /// 已到期的任务
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<BackupTask>> {
        Ok(self
            .store
            .list_enabled_tasks()
            .await?
            .into_iter()
            .filter(|task| is_due(task, now))
            .collect())
    }

    /// 重新计算单个任务的下一次运行时间
    pub async fn update_task_next_run(&self, task_id: i64) -> Result<Option<DateTime<Utc>>> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| BackupError::not_found(format!("任务 {task_id} 不存在")))?;
        let next = if task.is_scheduled() {
            next_run_local(&task.schedule, self.clock.now())
        } else {
            None
        };
        self.store.update_task_next_run(task_id, next).await?;
        self.events.publish(CoreEvent::TaskScheduled {
            task_id,
            next_run: next,
        });
        Ok(next)
    }

    /// 执行一轮检查，返回成功触发的任务
    ///
    /// 触发失败（正在运行、缺少密码等）不会重试，下一次运行时间照常推进。
    /// 单个任务保存下一次运行时间失败时发布 PersistenceFailed，继续处理其余任务。
    pub async fn poll_once(&self) -> Result<Vec<i64>> {
        let now = self.clock.now();
        let due = self.due_tasks(now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }
        debug!("到期任务数: {}", due.len());

        let mut triggered = Vec::new();
        for task in due {
            match self.backups.run(task.id).await {
                Ok(_handle) => {
                    info!(task_id = task.id, "定时任务已触发: {}", task.name);
                    self.events
                        .publish(CoreEvent::TaskTriggered { task_id: task.id });
                    triggered.push(task.id);
                }
                Err(e) => {
                    warn!(task_id = task.id, "定时任务触发失败: {}", e);
                    self.events.publish(CoreEvent::TaskTriggerFailed {
                        task_id: task.id,
                        message: e.to_string(),
                    });
                }
            }

            if let Err(e) = self.advance(task.id, now).await {
                error!(task_id = task.id, "更新下一次运行时间失败: {}", e);
                self.events.publish(CoreEvent::PersistenceFailed {
                    task_id: task.id,
                    message: format!("更新下一次运行时间失败: {e}"),
                });
            }
        }
        Ok(triggered)
    }

    /// 按最新的任务定义推进下一次运行时间，任务已删除时跳过
    async fn advance(&self, task_id: i64, now: DateTime<Utc>) -> Result<()> {
        let next = match self.store.get_task(task_id).await? {
            Some(current) if current.is_scheduled() => next_run_local(&current.schedule, now),
            Some(_) => None,
            None => return Ok(()),
        };
        self.store.update_task_next_run(task_id, next).await?;
        self.events.publish(CoreEvent::TaskScheduled {
            task_id,
            next_run: next,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// 启动轮询循环，重复调用无效
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.poll_once().await {
                            error!("调度检查失败: {}", e);
                        }
                    }
                }
            }
            debug!("调度循环已退出");
        });

        info!("调度器已启动，轮询间隔 {:?}", self.interval);
        *running = Some((token, handle));
    }

    /// 停止轮询循环，不影响正在执行的备份
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("调度循环异常退出: {}", e);
            }
            info!("调度器已停止");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveTime, Weekday};

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_daily_rolls_to_next_day() {
        let schedule = Schedule::daily(time(2, 0));
        assert_eq!(
            next_run(&schedule, &utc(2024, 6, 3, 3, 0)),
            Some(utc(2024, 6, 4, 2, 0))
        );
        assert_eq!(
            next_run(&schedule, &utc(2024, 6, 3, 1, 0)),
            Some(utc(2024, 6, 3, 2, 0))
        );
        // 严格晚于当前时刻
        assert_eq!(
            next_run(&schedule, &utc(2024, 6, 3, 2, 0)),
            Some(utc(2024, 6, 4, 2, 0))
        );
    }

    #[test]
    fn test_weekly_same_week_and_roll_over() {
        // 2024-06-03 是周一
        let wednesday = Schedule::weekly(Weekday::Wed, time(9, 30));
        assert_eq!(
            next_run(&wednesday, &utc(2024, 6, 3, 10, 0)),
            Some(utc(2024, 6, 5, 9, 30))
        );

        let monday = Schedule::weekly(Weekday::Mon, time(9, 0));
        assert_eq!(
            next_run(&monday, &utc(2024, 6, 3, 10, 0)),
            Some(utc(2024, 6, 10, 9, 0))
        );
        assert_eq!(
            next_run(&monday, &utc(2024, 6, 3, 8, 0)),
            Some(utc(2024, 6, 3, 9, 0))
        );
    }

    #[test]
    fn test_monthly_uses_first_of_next_month() {
        let mut schedule = Schedule::monthly(time(4, 0));
        schedule.day_of_month = Some(15);
        assert_eq!(
            next_run(&schedule, &utc(2024, 6, 3, 10, 0)),
            Some(utc(2024, 7, 1, 4, 0))
        );
        assert_eq!(
            next_run(&schedule, &utc(2024, 12, 31, 23, 0)),
            Some(utc(2025, 1, 1, 4, 0))
        );
    }

    #[test]
    fn test_hourly_and_unscheduled() {
        let now = utc(2024, 6, 3, 10, 17);
        assert_eq!(next_run(&Schedule::hourly(), &now), Some(utc(2024, 6, 3, 11, 17)));
        assert_eq!(next_run(&Schedule::manual(), &now), None);
        assert_eq!(next_run(&Schedule::default(), &now), None);
    }

    #[test]
    fn test_daily_in_fixed_offset() {
        let tz = FixedOffset::east_opt(8 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2024, 6, 3, 3, 0, 0).unwrap();
        assert_eq!(
            next_run(&Schedule::daily(time(2, 0)), &now),
            Some(utc(2024, 6, 3, 18, 0))
        );
    }

    #[test]
    fn test_disabled_or_manual_never_due() {
        let now = utc(2024, 6, 3, 10, 0);
        let mut task = BackupTask::new("t", 1, vec!["/data".into()], Schedule::hourly());
        task.next_run = Some(now - Duration::minutes(1));
        assert!(is_due(&task, now));

        task.enabled = false;
        assert!(!is_due(&task, now));

        task.enabled = true;
        task.schedule = Schedule::manual();
        assert!(!is_due(&task, now));

        task.schedule = Schedule::hourly();
        task.next_run = Some(now + Duration::minutes(1));
        assert!(!is_due(&task, now));
    }

    #[cfg(unix)]
    mod polling {
        use super::*;
        use crate::coordinator::testing::{add_repository, harness};
        use crate::coordinator::SlotScope;
        use crate::test_support::invocation_count;
        use secrecy::SecretString;
        use tempfile::tempdir;

        const SUCCESS: &str = r#"echo '{"message_type":"summary","snapshot_id":"abc123"}'"#;

        async fn insert_task(
            store: &dyn TaskStore,
            repository_id: i64,
            schedule: Schedule,
            enabled: bool,
            next_run: Option<DateTime<Utc>>,
        ) -> i64 {
            let mut task = BackupTask::new("定时", repository_id, vec!["/data".into()], schedule);
            task.enabled = enabled;
            task.next_run = next_run;
            store.insert_task(&task).await.unwrap()
        }

        #[tokio::test]
        async fn test_due_tasks_filters_disabled_and_manual() {
            let temp_dir = tempdir().unwrap();
            let h = harness(temp_dir.path(), SUCCESS).await;
            let repo = add_repository(&h.services, "r").await;
            let now = h.services.clock.now();
            let past = Some(now - Duration::hours(1));

            let due = insert_task(h.store.as_ref(), repo.id, Schedule::hourly(), true, past).await;
            insert_task(h.store.as_ref(), repo.id, Schedule::hourly(), false, past).await;
            insert_task(h.store.as_ref(), repo.id, Schedule::manual(), true, past).await;
            insert_task(h.store.as_ref(), repo.id, Schedule::hourly(), true, None).await;

            let backups = BackupCoordinator::new(h.services.clone(), SlotScope::Repository);
            let scheduler = Scheduler::new(backups, std::time::Duration::from_secs(60));
            let ids: Vec<i64> = scheduler.due_tasks(now).await.unwrap().iter().map(|t| t.id).collect();
            assert_eq!(ids, vec![due]);
        }

        #[tokio::test]
        async fn test_initialize_fills_and_clears_next_run() {
            let temp_dir = tempdir().unwrap();
            let h = harness(temp_dir.path(), SUCCESS).await;
            let repo = add_repository(&h.services, "r").await;
            let now = h.services.clock.now();

            let missing = insert_task(h.store.as_ref(), repo.id, Schedule::hourly(), true, None).await;
            let stale =
                insert_task(h.store.as_ref(), repo.id, Schedule::manual(), true, Some(now)).await;

            let backups = BackupCoordinator::new(h.services.clone(), SlotScope::Repository);
            let scheduler = Scheduler::new(backups, std::time::Duration::from_secs(60));
            assert_eq!(scheduler.initialize().await.unwrap(), 2);

            let filled = h.store.get_task(missing).await.unwrap().unwrap();
            assert_eq!(filled.next_run, Some(now + Duration::hours(1)));
            let cleared = h.store.get_task(stale).await.unwrap().unwrap();
            assert_eq!(cleared.next_run, None);
        }

        #[tokio::test]
        async fn test_poll_triggers_and_advances() {
            let temp_dir = tempdir().unwrap();
            let h = harness(temp_dir.path(), SUCCESS).await;
            let repo = add_repository(&h.services, "r").await;
            h.services
                .credentials
                .set(repo.id, SecretString::from("pw"))
                .await
                .unwrap();
            let now = h.services.clock.now();
            let task_id = insert_task(
                h.store.as_ref(),
                repo.id,
                Schedule::hourly(),
                true,
                Some(now - Duration::minutes(5)),
            )
            .await;

            let mut rx = h.services.events.subscribe();
            let backups = BackupCoordinator::new(h.services.clone(), SlotScope::Repository);
            let scheduler = Scheduler::new(backups, std::time::Duration::from_secs(60));

            assert_eq!(scheduler.poll_once().await.unwrap(), vec![task_id]);

            let task = h.store.get_task(task_id).await.unwrap().unwrap();
            assert_eq!(task.next_run, Some(now + Duration::hours(1)));
            // 已推进，不会重复触发
            assert!(scheduler.poll_once().await.unwrap().is_empty());

            loop {
                let event = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if let CoreEvent::BackupFinished { success, .. } = event {
                    assert!(success);
                    break;
                }
            }
            assert_eq!(invocation_count(temp_dir.path()), 1);
        }

        #[tokio::test]
        async fn test_trigger_failure_still_advances() {
            let temp_dir = tempdir().unwrap();
            let h = harness(temp_dir.path(), SUCCESS).await;
            let repo = add_repository(&h.services, "r").await;
            let now = h.services.clock.now();
            let task_id = insert_task(
                h.store.as_ref(),
                repo.id,
                Schedule::hourly(),
                true,
                Some(now - Duration::minutes(5)),
            )
            .await;

            let mut rx = h.services.events.subscribe();
            let backups = BackupCoordinator::new(h.services.clone(), SlotScope::Repository);
            let scheduler = Scheduler::new(backups, std::time::Duration::from_secs(60));

            assert!(scheduler.poll_once().await.unwrap().is_empty());
            assert_eq!(invocation_count(temp_dir.path()), 0);

            let mut saw_failure = false;
            while let Ok(event) = rx.try_recv() {
                if let CoreEvent::TaskTriggerFailed { task_id: id, .. } = event {
                    assert_eq!(id, task_id);
                    saw_failure = true;
                }
            }
            assert!(saw_failure);
            let task = h.store.get_task(task_id).await.unwrap().unwrap();
            assert_eq!(task.next_run, Some(now + Duration::hours(1)));
        }

        #[tokio::test]
        async fn test_persistence_failure_does_not_stop_the_round() {
            let temp_dir = tempdir().unwrap();
            let h = harness(temp_dir.path(), SUCCESS).await;
            let repo = add_repository(&h.services, "r").await;
            let now = h.services.clock.now();
            let past = Some(now - Duration::minutes(5));
            let first = insert_task(h.store.as_ref(), repo.id, Schedule::hourly(), true, past).await;
            let second = insert_task(h.store.as_ref(), repo.id, Schedule::hourly(), true, past).await;

            let mut rx = h.services.events.subscribe();
            let backups = BackupCoordinator::new(h.services.clone(), SlotScope::Repository);
            let scheduler = Scheduler::new(backups, std::time::Duration::from_secs(60));
            h.faults.fail("update_task_next_run");

            assert!(scheduler.poll_once().await.unwrap().is_empty());

            let mut trigger_failed = Vec::new();
            let mut persistence_failed = Vec::new();
            while let Ok(event) = rx.try_recv() {
                match event {
                    CoreEvent::TaskTriggerFailed { task_id, .. } => trigger_failed.push(task_id),
                    CoreEvent::PersistenceFailed { task_id, .. } => persistence_failed.push(task_id),
                    _ => {}
                }
            }
            assert_eq!(trigger_failed, vec![first, second]);
            assert_eq!(persistence_failed, vec![first, second]);

            h.faults.recover("update_task_next_run");
            assert!(scheduler.poll_once().await.unwrap().is_empty());
            for id in [first, second] {
                let task = h.store.get_task(id).await.unwrap().unwrap();
                assert_eq!(task.next_run, Some(now + Duration::hours(1)));
            }
        }

        #[tokio::test]
        async fn test_disabled_during_round_clears_next_run() {
            let temp_dir = tempdir().unwrap();
            let h = harness(temp_dir.path(), SUCCESS).await;
            let repo = add_repository(&h.services, "r").await;
            let now = h.services.clock.now();
            let task_id = insert_task(
                h.store.as_ref(),
                repo.id,
                Schedule::hourly(),
                true,
                Some(now - Duration::minutes(5)),
            )
            .await;

            let backups = BackupCoordinator::new(h.services.clone(), SlotScope::Repository);
            let scheduler = Scheduler::new(backups, std::time::Duration::from_secs(60));
            let due = scheduler.due_tasks(now).await.unwrap();
            assert_eq!(due.len(), 1);

            // 到期列表取出后任务被禁用
            let mut task = h.store.get_task(task_id).await.unwrap().unwrap();
            task.enabled = false;
            h.store.update_task(&task).await.unwrap();

            scheduler.advance(task_id, now).await.unwrap();
            assert_eq!(h.store.get_task(task_id).await.unwrap().unwrap().next_run, None);
        }

        #[tokio::test]
        async fn test_start_and_stop() {
            let temp_dir = tempdir().unwrap();
            let h = harness(temp_dir.path(), SUCCESS).await;
            let backups = BackupCoordinator::new(h.services.clone(), SlotScope::Repository);
            let scheduler = Arc::new(Scheduler::new(backups, std::time::Duration::from_millis(20)));

            scheduler.start();
            scheduler.start();
            assert!(scheduler.is_running());
            scheduler.stop().await;
            assert!(!scheduler.is_running());
        }
    }
}
