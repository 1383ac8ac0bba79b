//! 定时同步调度
//!
//! 调度状态以墙上时间记录（上次触发时间、下次到期时间），计时器本身使用单调时钟。
//! 主机休眠期间单调时钟可能停走，因此唤醒后需要对账：
//! 错过的周期只补跑一次，未错过的则改为只等待剩余时间，之后恢复正常周期。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as TimeDelta, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// 持久化的触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// 仅手动同步
    Manual,
    /// 程序启动时同步一次
    ApplicationStart,
    /// 每 N 小时
    EveryHours(u32),
}

impl SyncTrigger {
    pub fn period(&self) -> Option<TimeDelta> {
        match self {
            SyncTrigger::EveryHours(h) => Some(TimeDelta::hours(i64::from(*h))),
            _ => None,
        }
    }
}

impl FromStr for SyncTrigger {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "manual" | "none" => Ok(SyncTrigger::Manual),
            "application_start" => Ok(SyncTrigger::ApplicationStart),
            "1H" => Ok(SyncTrigger::EveryHours(1)),
            "12H" => Ok(SyncTrigger::EveryHours(12)),
            "24H" => Ok(SyncTrigger::EveryHours(24)),
            other => Err(anyhow!("无效的同步计划: {}", other)),
        }
    }
}

impl fmt::Display for SyncTrigger {
    /// 与设置表中保存的值一致
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Manual => Ok(()),
            SyncTrigger::ApplicationStart => f.write_str("application_start"),
            SyncTrigger::EveryHours(h) => write!(f, "{}H", h),
        }
    }
}

/// 触发一次同步的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Manual,
    Scheduled,
    Startup,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerReason::Manual => "manual",
            TriggerReason::Scheduled => "scheduled",
            TriggerReason::Startup => "startup",
        })
    }
}

/// 唤醒对账的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeAction {
    /// 未启用周期计划
    Ignored,
    /// 已错过一个周期：立即补跑一次，计时器从现在起重新计满一个周期
    RunNow,
    /// 未错过：改为等待剩余时间的一次性计时器
    Rearmed(TimeDelta),
}

/// 调度状态机
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Periodic {
        period: TimeDelta,
        last_fired: DateTime<Utc>,
        due: DateTime<Utc>,
    },
    /// 唤醒后的一次性计时器，到期后回到 `Periodic`
    CatchUp {
        period: TimeDelta,
        last_fired: DateTime<Utc>,
        due: DateTime<Utc>,
    },
}

impl ScheduleState {
    /// 以 `now` 为起点装上周期计时器（替换已有计时器）
    pub fn arm(period: TimeDelta, now: DateTime<Utc>) -> Self {
        ScheduleState::Periodic {
            period,
            last_fired: now,
            due: now + period,
        }
    }

    pub fn due(&self) -> Option<DateTime<Utc>> {
        match self {
            ScheduleState::Idle => None,
            ScheduleState::Periodic { due, .. } | ScheduleState::CatchUp { due, .. } => Some(*due),
        }
    }

    /// 计时器到期；返回是否应运行同步
    pub fn on_timer(&mut self, now: DateTime<Utc>) -> bool {
        let (period, due, catch_up) = match self {
            ScheduleState::Idle => return false,
            ScheduleState::Periodic { period, due, .. } => (*period, *due, false),
            ScheduleState::CatchUp { period, due, .. } => (*period, *due, true),
        };
        if now < due {
            return false;
        }

        // 保持原有相位；若已落后一个周期以上则从现在重新计时，避免连续触发
        let mut next = if catch_up { now + period } else { due + period };
        if next <= now {
            next = now + period;
        }
        *self = ScheduleState::Periodic {
            period,
            last_fired: now,
            due: next,
        };
        true
    }

    /// 主机唤醒后的对账
    pub fn on_resume(&mut self, now: DateTime<Utc>) -> ResumeAction {
        let (period, last_fired) = match self {
            ScheduleState::Idle => return ResumeAction::Ignored,
            ScheduleState::Periodic {
                period, last_fired, ..
            }
            | ScheduleState::CatchUp {
                period, last_fired, ..
            } => (*period, *last_fired),
        };

        let elapsed = now - last_fired;
        if elapsed >= period {
            *self = ScheduleState::arm(period, now);
            ResumeAction::RunNow
        } else {
            let remaining = period - elapsed;
            *self = ScheduleState::CatchUp {
                period,
                last_fired,
                due: now + remaining,
            };
            ResumeAction::Rearmed(remaining)
        }
    }
}

/// 通过比较墙上时间和单调时间的流逝量来发现休眠
#[derive(Debug)]
pub struct ResumeDetector {
    last_wall: DateTime<Utc>,
    last_mono: Instant,
    threshold: TimeDelta,
}

impl ResumeDetector {
    pub fn new(threshold: TimeDelta, wall: DateTime<Utc>, mono: Instant) -> Self {
        Self {
            last_wall: wall,
            last_mono: mono,
            threshold,
        }
    }

    /// 记录一次观测，返回自上次观测以来是否发生过休眠
    pub fn observe(&mut self, wall: DateTime<Utc>, mono: Instant) -> bool {
        let wall_elapsed = wall - self.last_wall;
        let mono_elapsed = TimeDelta::from_std(mono.saturating_duration_since(self.last_mono))
            .unwrap_or_else(|_| TimeDelta::zero());
        self.last_wall = wall;
        self.last_mono = mono;
        wall_elapsed - mono_elapsed > self.threshold
    }
}

/// 执行一次完整同步
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, reason: TriggerReason) -> Result<()>;
}

/// 调度器参数
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// 休眠检测的间隔
    pub resume_check: Duration,
    /// 墙上时间比单调时间多走超过该值即视为发生过休眠
    pub resume_drift: TimeDelta,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            resume_check: Duration::from_secs(30),
            resume_drift: TimeDelta::seconds(120),
        }
    }
}

enum Command {
    Apply(SyncTrigger),
    Resume,
    Shutdown,
}

/// 调度任务句柄
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// 应用新的触发方式
    pub async fn apply(&self, trigger: SyncTrigger) -> Result<()> {
        self.tx
            .send(Command::Apply(trigger))
            .await
            .map_err(|_| anyhow!("调度器已停止"))
    }

    /// 外部（例如电源事件）通知主机已唤醒
    pub async fn notify_resume(&self) -> Result<()> {
        self.tx
            .send(Command::Resume)
            .await
            .map_err(|_| anyhow!("调度器已停止"))
    }

    /// 停止调度；正在进行的同步会先完成
    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        let _ = self.join.await;
    }
}

/// 同步调度器
pub struct SyncScheduler {
    runner: Arc<dyn CycleRunner>,
    state: ScheduleState,
    options: SchedulerOptions,
}

impl SyncScheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, options: SchedulerOptions) -> Self {
        Self {
            runner,
            state: ScheduleState::Idle,
            options,
        }
    }

    /// 在后台运行调度循环
    pub fn spawn(self) -> SchedulerHandle {
        let (tx, rx) = mpsc::channel(16);
        let join = tokio::spawn(self.run(rx));
        SchedulerHandle { tx, join }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        info!("同步调度器已启动");

        let mut detector =
            ResumeDetector::new(self.options.resume_drift, Utc::now(), Instant::now());
        let mut check = tokio::time::interval(self.options.resume_check);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wait = self
                .state
                .due()
                .map(|due| (due - Utc::now()).to_std().unwrap_or(Duration::ZERO));
            let timer = async move {
                match wait {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Apply(trigger)) => self.apply(trigger).await,
                    Some(Command::Resume) => self.reconcile(Utc::now()).await,
                    Some(Command::Shutdown) | None => break,
                },
                _ = timer => {
                    if self.state.on_timer(Utc::now()) {
                        self.fire(TriggerReason::Scheduled).await;
                    }
                }
                _ = check.tick() => {
                    if detector.observe(Utc::now(), Instant::now()) {
                        info!("检测到主机从休眠中恢复");
                        self.reconcile(Utc::now()).await;
                    }
                }
            }
        }

        self.state = ScheduleState::Idle;
        info!("同步调度器已停止");
    }

    async fn apply(&mut self, trigger: SyncTrigger) {
        info!("应用同步计划: {:?}", trigger);
        match trigger {
            SyncTrigger::Manual => {
                self.state = ScheduleState::Idle;
            }
            SyncTrigger::ApplicationStart => {
                self.state = ScheduleState::Idle;
                self.fire(TriggerReason::Startup).await;
            }
            SyncTrigger::EveryHours(_) => {
                if let Some(period) = trigger.period() {
                    self.state = ScheduleState::arm(period, Utc::now());
                    debug!("下次同步: {:?}", self.state.due());
                }
            }
        }
    }

    async fn reconcile(&mut self, now: DateTime<Utc>) {
        match self.state.on_resume(now) {
            ResumeAction::Ignored => {}
            ResumeAction::RunNow => {
                info!("休眠期间错过了同步，立即补跑");
                self.fire(TriggerReason::Scheduled).await;
            }
            ResumeAction::Rearmed(remaining) => {
                info!("计时器已重新校准，剩余 {} 秒", remaining.num_seconds());
            }
        }
    }

    async fn fire(&self, reason: TriggerReason) {
        if let Err(e) = self.runner.run_cycle(reason).await {
            // 计时器保持不变，下个周期再试
            error!("同步未执行 ({}): {}", reason, e);
        } else {
            debug!("同步已触发 ({})", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn trigger_strings_round_trip() {
        for raw in ["", "application_start", "1H", "12H", "24H"] {
            let trigger: SyncTrigger = raw.parse().unwrap();
            assert_eq!(trigger.to_string(), raw);
        }
        assert_eq!("none".parse::<SyncTrigger>().unwrap(), SyncTrigger::Manual);
        assert!("2H".parse::<SyncTrigger>().is_err());
    }

    #[test]
    fn timer_fires_once_per_period() {
        let hour = TimeDelta::hours(1);
        let mut state = ScheduleState::arm(hour, t0());

        assert!(!state.on_timer(t0() + TimeDelta::minutes(59)));
        assert!(state.on_timer(t0() + hour));
        assert!(!state.on_timer(t0() + hour + TimeDelta::seconds(1)));
        assert_eq!(state.due(), Some(t0() + hour * 2));
    }

    #[test]
    fn late_timer_does_not_fire_twice() {
        let hour = TimeDelta::hours(1);
        let mut state = ScheduleState::arm(hour, t0());
        let late = t0() + TimeDelta::minutes(150);

        assert!(state.on_timer(late));
        assert!(!state.on_timer(late));
        assert_eq!(state.due(), Some(late + hour));
    }

    #[test]
    fn resume_after_missed_periods_runs_exactly_once() {
        let hour = TimeDelta::hours(1);
        let mut state = ScheduleState::arm(hour, t0());
        let wake = t0() + TimeDelta::hours(3);

        assert_eq!(state.on_resume(wake), ResumeAction::RunNow);
        assert_eq!(state.due(), Some(wake + hour));

        // 唤醒后不会因为旧的到期时间再触发
        assert!(!state.on_timer(wake));
        assert!(!state.on_timer(wake + TimeDelta::minutes(30)));
        assert!(state.on_timer(wake + hour));
        assert_eq!(state.due(), Some(wake + hour * 2));
    }

    #[test]
    fn resume_within_period_waits_for_remaining_time() {
        let hour = TimeDelta::hours(1);
        let mut state = ScheduleState::arm(hour, t0());
        let wake = t0() + TimeDelta::minutes(20);

        assert_eq!(
            state.on_resume(wake),
            ResumeAction::Rearmed(TimeDelta::minutes(40))
        );
        assert!(matches!(state, ScheduleState::CatchUp { .. }));
        assert_eq!(state.due(), Some(t0() + hour));

        let fired_at = t0() + hour;
        assert!(state.on_timer(fired_at));
        assert!(matches!(state, ScheduleState::Periodic { .. }));
        assert_eq!(state.due(), Some(fired_at + hour));
    }

    #[test]
    fn idle_state_ignores_resume_and_timer() {
        let mut state = ScheduleState::Idle;
        assert_eq!(state.on_resume(t0()), ResumeAction::Ignored);
        assert!(!state.on_timer(t0()));
        assert_eq!(state, ScheduleState::Idle);
    }

    #[test]
    fn detector_flags_wall_clock_jump() {
        let mono = Instant::now();
        let mut detector = ResumeDetector::new(TimeDelta::seconds(120), t0(), mono);

        let mono = mono + Duration::from_secs(30);
        assert!(!detector.observe(t0() + TimeDelta::seconds(31), mono));

        // 墙上时间走了 2 小时，单调时间只走了 30 秒
        let mono = mono + Duration::from_secs(30);
        assert!(detector.observe(t0() + TimeDelta::hours(2), mono));
    }

    #[derive(Default)]
    struct Recorder {
        count: AtomicUsize,
        reasons: Mutex<Vec<TriggerReason>>,
    }

    #[async_trait]
    impl CycleRunner for Recorder {
        async fn run_cycle(&self, reason: TriggerReason) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.reasons.lock().unwrap().push(reason);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CycleRunner for Failing {
        async fn run_cycle(&self, _reason: TriggerReason) -> Result<()> {
            Err(anyhow!("同步目录不存在"))
        }
    }

    #[tokio::test]
    async fn failed_cycle_keeps_timer_armed() {
        let hour = TimeDelta::hours(1);
        let mut scheduler = SyncScheduler::new(Arc::new(Failing), SchedulerOptions::default());
        scheduler.state = ScheduleState::arm(hour, t0());

        assert!(scheduler.state.on_timer(t0() + hour));
        scheduler.fire(TriggerReason::Scheduled).await;

        assert_eq!(
            scheduler.state,
            ScheduleState::Periodic {
                period: hour,
                last_fired: t0() + hour,
                due: t0() + hour * 2,
            }
        );
        // 下一个周期照常到期
        assert!(scheduler.state.on_timer(t0() + hour * 2));
    }

    #[tokio::test]
    async fn application_start_runs_one_cycle() {
        let recorder = Arc::new(Recorder::default());
        let handle = SyncScheduler::new(recorder.clone(), SchedulerOptions::default()).spawn();

        handle.apply(SyncTrigger::ApplicationStart).await.unwrap();
        handle.apply(SyncTrigger::Manual).await.unwrap();
        handle.shutdown().await;

        assert_eq!(recorder.count.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.reasons.lock().unwrap(), vec![TriggerReason::Startup]);
    }

    #[tokio::test]
    async fn periodic_trigger_does_not_fire_immediately() {
        let recorder = Arc::new(Recorder::default());
        let handle = SyncScheduler::new(recorder.clone(), SchedulerOptions::default()).spawn();

        handle.apply(SyncTrigger::EveryHours(1)).await.unwrap();
        handle.notify_resume().await.unwrap();
        handle.shutdown().await;

        assert_eq!(recorder.count.load(Ordering::SeqCst), 0);
    }
}
