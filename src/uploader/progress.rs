// 上传进度上报

use parking_lot::Mutex;
use std::sync::Arc;

/// 进度回调，参数为 0-100
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// 上传阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    /// 0-5%
    Start,
    /// 5-90%
    Transfer,
    /// 90-100%
    Finish,
}

impl UploadPhase {
    fn range(&self) -> (f64, f64) {
        match self {
            UploadPhase::Start => (0.0, 5.0),
            UploadPhase::Transfer => (5.0, 90.0),
            UploadPhase::Finish => (90.0, 100.0),
        }
    }
}

/// 把阶段内进度映射到整体进度，并保证单调不减
///
/// 重试时传输会从头开始，已上报过的进度不会回退
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    last: Mutex<f64>,
}

impl ProgressReporter {
    pub fn new(callback: ProgressCallback) -> Self {
        Self {
            callback: Some(callback),
            last: Mutex::new(0.0),
        }
    }

    /// 不上报的空实现
    pub fn silent() -> Self {
        Self {
            callback: None,
            last: Mutex::new(0.0),
        }
    }

    /// 上报阶段内进度
    ///
    /// # 参数
    /// * `phase` - 当前阶段
    /// * `fraction` - 阶段内完成比例（0.0 - 1.0）
    ///
    /// # 返回
    /// 当前整体进度
    pub fn report(&self, phase: UploadPhase, fraction: f64) -> f64 {
        let (lo, hi) = phase.range();
        let value = lo + (hi - lo) * fraction.clamp(0.0, 1.0);

        let mut last = self.last.lock();
        if value <= *last {
            return *last;
        }
        *last = value;
        drop(last);

        if let Some(callback) = &self.callback {
            callback(value);
        }
        value
    }

    pub fn current(&self) -> f64 {
        *self.last.lock()
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_mapping_is_monotonic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(Arc::new(move |p| sink.lock().push(p)));

        reporter.report(UploadPhase::Start, 0.0);
        reporter.report(UploadPhase::Start, 1.0);
        reporter.report(UploadPhase::Transfer, 0.5);
        // 重试回到起点，不回退
        reporter.report(UploadPhase::Start, 0.0);
        reporter.report(UploadPhase::Transfer, 0.2);
        reporter.report(UploadPhase::Transfer, 1.0);
        reporter.report(UploadPhase::Finish, 1.0);

        let values = seen.lock().clone();
        assert_eq!(values, vec![5.0, 47.5, 90.0, 100.0]);
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(reporter.current(), 100.0);
    }

    #[test]
    fn test_silent_reporter_tracks_value() {
        let reporter = ProgressReporter::silent();
        assert_eq!(reporter.report(UploadPhase::Transfer, 2.0), 90.0);
        assert_eq!(reporter.current(), 90.0);
    }
}
