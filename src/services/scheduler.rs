//! Recurring tasks with their own shutdown signal
//!
//! A task runs its job either on a fixed interval or once a day at a local
//! hour. Jobs contain their own errors; the loop only stops when the shutdown
//! channel flips to `true` or its sender is dropped.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Every(Duration),
    DailyAt { hour: u32, tz: Tz },
}

#[derive(Debug, Clone)]
pub struct RecurringTask {
    name: &'static str,
    schedule: Schedule,
}

/// Next time the local clock in `tz` reads `hour:00:00`, strictly after `now`
pub fn next_daily_run(now: DateTime<Utc>, hour: u32, tz: Tz) -> DateTime<Utc> {
    let target = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let local_today = now.with_timezone(&tz).date_naive();

    for offset in 0..3 {
        let day = local_today + ChronoDuration::days(offset);
        // A local time skipped by DST has no instant; try the next day
        if let Some(at) = tz.from_local_datetime(&day.and_time(target)).earliest() {
            let at = at.with_timezone(&Utc);
            if at > now {
                return at;
            }
        }
    }
    now + ChronoDuration::days(1)
}

impl RecurringTask {
    pub fn every(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            schedule: Schedule::Every(period),
        }
    }

    pub fn daily_at(name: &'static str, hour: u32, tz: Tz) -> Self {
        Self {
            name,
            schedule: Schedule::DailyAt { hour, tz },
        }
    }

    pub fn spawn<F, Fut>(self, shutdown_rx: watch::Receiver<bool>, job: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.run(shutdown_rx, job))
    }

    pub async fn run<F, Fut>(self, mut shutdown_rx: watch::Receiver<bool>, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        info!("[Scheduler] {} started ({:?})", self.name, self.schedule);

        match self.schedule {
            Schedule::Every(period) => {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    tokio::select! {
                        _ = ticker.tick() => {
                            debug!("[Scheduler] {} firing", self.name);
                            job().await;
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
            Schedule::DailyAt { hour, tz } => loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let now = Utc::now();
                let next = next_daily_run(now, hour, tz);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                debug!("[Scheduler] {} next run at {}", self.name, next);

                tokio::select! {
                    _ = sleep(wait) => {
                        job().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            },
        }

        info!("[Scheduler] {} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_next_daily_run_in_local_zone() {
        let tz: Tz = chrono_tz::Asia::Shanghai;
        // 19:00 UTC is 03:00 next day in Shanghai, so 04:00 local is one hour away
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 19, 0, 0).unwrap();
        assert_eq!(next_daily_run(now, 4, tz), Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap());

        // Exactly at the hour schedules tomorrow
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();
        assert_eq!(next_daily_run(at, 4, tz), Utc.with_ymd_and_hms(2024, 5, 2, 20, 0, 0).unwrap());
    }

    #[test]
    fn test_next_daily_run_skips_dst_gap() {
        let tz: Tz = chrono_tz::America::New_York;
        // 02:00 does not exist on 2024-03-10
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 5, 0, 0).unwrap();
        let next = next_daily_run(now, 2, tz);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 11, 6, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_every_runs_until_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let handle = RecurringTask::every("test", Duration::from_millis(10)).spawn(shutdown_rx, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        sleep(Duration::from_millis(55)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 2, "ran {} times", runs);
        sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_daily_task_stops_on_sender_drop() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = RecurringTask::daily_at("sweep", 4, chrono_tz::UTC).spawn(shutdown_rx, || async {});
        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
