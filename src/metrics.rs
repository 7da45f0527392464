use crate::models::{Alert, AlertLevel, Train, TrainStatus};
use serde::Serialize;

/// Fleet and alert counters for the admin dashboard.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SystemMetrics {
    pub total_trains: usize,
    pub active_trains: usize,
    pub on_time_trains: usize,
    pub delayed_trains: usize,
    pub cancelled_trains: usize,
    pub active_alerts: usize,
    pub critical_alerts: usize,
    /// Share of active trains running on time, in whole percent.
    pub on_time_performance: u32,
}

impl SystemMetrics {
    pub fn compute(trains: &[Train], alerts: &[Alert]) -> Self {
        let mut m = SystemMetrics {
            total_trains: trains.len(),
            ..Default::default()
        };

        for t in trains {
            match t.status {
                TrainStatus::OnTime => m.on_time_trains += 1,
                TrainStatus::Delayed => m.delayed_trains += 1,
                TrainStatus::Cancelled => m.cancelled_trains += 1,
            }
        }
        m.active_trains = m.total_trains - m.cancelled_trains;

        for a in alerts.iter().filter(|a| a.is_active) {
            m.active_alerts += 1;
            if a.alert_level == AlertLevel::Critical {
                m.critical_alerts += 1;
            }
        }

        m.on_time_performance = if m.active_trains == 0 {
            0
        } else {
            ((m.on_time_trains as f64 / m.active_trains as f64) * 100.0).round() as u32
        };
        m
    }
}
