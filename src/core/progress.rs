//! 进度通知 - 以 10% 为步长，只在增长时发送

use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// 同步阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Upload,
    Delete,
    Metadata,
    Tags,
    Clear,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Upload => write!(f, "upload"),
            Phase::Delete => write!(f, "delete"),
            Phase::Metadata => write!(f, "metadata"),
            Phase::Tags => write!(f, "tags"),
            Phase::Clear => write!(f, "clear"),
        }
    }
}

/// 进度事件，仅供观察，不影响控制流
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ProgressEvent {
    Progress {
        target: String,
        phase: Phase,
        percent: u8,
    },
    Finished {
        target: String,
        phase: Phase,
        success: bool,
    },
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// floor(completed / total * 10) * 10，不超过 100
pub fn decile(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let completed = completed.min(total);
    ((completed * 10 / total) * 10) as u8
}

#[derive(Debug, Default)]
struct TrackerState {
    completed: u64,
    last_percent: u8,
}

/// 单个目标单个阶段的进度累计
#[derive(Debug)]
pub struct ProgressTracker {
    target: String,
    phase: Phase,
    total: u64,
    state: Mutex<TrackerState>,
    tx: Option<ProgressSender>,
}

impl ProgressTracker {
    pub fn new(target: impl Into<String>, phase: Phase, total: u64, tx: Option<ProgressSender>) -> Self {
        Self {
            target: target.into(),
            phase,
            total,
            state: Mutex::new(TrackerState::default()),
            tx,
        }
    }

    /// 累加完成量；跨过新的 10% 档位时发送一次通知
    pub fn advance(&self, units: u64) {
        // 在锁内发送，保证通知顺序与档位顺序一致
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.completed = state.completed.saturating_add(units);

        let percent = decile(state.completed, self.total);
        if percent > state.last_percent {
            state.last_percent = percent;
            if let Some(tx) = &self.tx {
                let _ = tx.send(ProgressEvent::Progress {
                    target: self.target.clone(),
                    phase: self.phase,
                    percent,
                });
            }
        }
    }

    pub fn finish(&self, success: bool) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent::Finished {
                target: self.target.clone(),
                phase: self.phase,
                success,
            });
        }
    }

    pub fn completed(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).completed
    }
}

/// 发送阶段结束事件
pub fn notify_finished(tx: Option<&ProgressSender>, target: &str, phase: Phase, success: bool) {
    if let Some(tx) = tx {
        let _ = tx.send(ProgressEvent::Finished {
            target: target.to_string(),
            phase,
            success,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Progress { percent, .. } = event {
                out.push(percent);
            }
        }
        out
    }

    #[test]
    fn test_decile() {
        assert_eq!(decile(0, 10), 0);
        assert_eq!(decile(1, 10), 10);
        assert_eq!(decile(19, 100), 10);
        assert_eq!(decile(99, 100), 90);
        assert_eq!(decile(100, 100), 100);
        assert_eq!(decile(150, 100), 100);
        assert_eq!(decile(0, 0), 100);
    }

    #[test]
    fn test_emits_only_on_increments() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new("site", Phase::Upload, 100, Some(tx));

        for _ in 0..100 {
            tracker.advance(1);
        }

        let percents = drain(&mut rx);
        assert_eq!(percents, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
    }

    #[test]
    fn test_large_steps_skip_deciles_and_cap_at_100() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new("site", Phase::Delete, 3, Some(tx));

        tracker.advance(1);
        tracker.advance(0);
        tracker.advance(5);
        tracker.advance(1);

        let percents = drain(&mut rx);
        assert_eq!(percents, vec![30, 100]);
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(tracker.completed(), 7);
    }

    #[test]
    fn test_finish_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new("site", Phase::Metadata, 1, Some(tx));
        tracker.finish(false);
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::Finished {
                target: "site".to_string(),
                phase: Phase::Metadata,
                success: false
            }
        );
    }
}
