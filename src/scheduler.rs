//! Interval triggers for source runs, the DNS dedup jobs and the cloud
//! provider lists.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::{AppConfig, CloudProvider};
use crate::dedup::DnsDeduplicator;
use crate::export::CloudLists;
use crate::error::PipelineError;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Source(String),
    DnsResolve,
    DnsSweep,
    CloudLists(Vec<CloudProvider>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTask {
    pub task: Task,
    pub every: Duration,
}

/// Repeating tasks implied by the settings. Sources without an interval
/// only run as part of a full run.
pub fn plan(config: &AppConfig) -> Vec<ScheduledTask> {
    let minutes = |m: u64| Duration::from_secs(m.max(1) * 60);
    let mut tasks: Vec<ScheduledTask> = config
        .sources
        .iter()
        .filter(|s| s.enabled)
        .filter_map(|s| {
            s.schedule_interval_minutes.map(|m| ScheduledTask {
                task: Task::Source(s.name.clone()),
                every: minutes(m),
            })
        })
        .collect();
    if let Some(m) = config.dns.resolve_interval_minutes {
        tasks.push(ScheduledTask {
            task: Task::DnsResolve,
            every: minutes(m),
        });
    }
    if let Some(m) = config.dns.sweep_interval_minutes {
        tasks.push(ScheduledTask {
            task: Task::DnsSweep,
            every: minutes(m),
        });
    }
    if let Some(m) = config.cloud.interval_minutes {
        if !config.cloud.providers.is_empty() {
            tasks.push(ScheduledTask {
                task: Task::CloudLists(config.cloud.providers.clone()),
                every: minutes(m),
            });
        }
    }
    tasks
}

/// Running scheduler. Dropping it leaves the jobs running; call
/// [`FeedScheduler::shutdown`] to stop them.
pub struct FeedScheduler {
    inner: JobScheduler,
    jobs: usize,
}

impl FeedScheduler {
    pub async fn start(
        pipeline: Arc<Pipeline>,
        dedup: Arc<DnsDeduplicator>,
        cloud: Arc<CloudLists>,
    ) -> Result<Self> {
        let inner = JobScheduler::new().await.context("Failed to create scheduler")?;
        let tasks = plan(&pipeline.config());

        for scheduled in &tasks {
            tracing::info!(task = ?scheduled.task, every_secs = scheduled.every.as_secs(), "Scheduling task");
            let job = match scheduled.task.clone() {
                Task::Source(name) => {
                    let pipeline = pipeline.clone();
                    Job::new_repeated_async(scheduled.every, move |_id, _lock| {
                        let pipeline = pipeline.clone();
                        let name = name.clone();
                        Box::pin(async move {
                            match pipeline.process_single(&name).await {
                                Ok(_) => {}
                                Err(PipelineError::SourceBusy(_)) => {
                                    tracing::info!(source = %name, "Previous run still in progress, skipping");
                                }
                                Err(e) => {
                                    tracing::error!(source = %name, error = %e, "Scheduled source run failed");
                                }
                            }
                        })
                    })
                }
                Task::DnsResolve => {
                    let dedup = dedup.clone();
                    Job::new_repeated_async(scheduled.every, move |_id, _lock| {
                        let dedup = dedup.clone();
                        Box::pin(async move {
                            if let Err(e) = dedup.resolve_batch().await {
                                tracing::error!(error = %e, "Scheduled DNS resolution failed");
                            }
                        })
                    })
                }
                Task::DnsSweep => {
                    let dedup = dedup.clone();
                    Job::new_repeated_async(scheduled.every, move |_id, _lock| {
                        let dedup = dedup.clone();
                        Box::pin(async move {
                            if let Err(e) = dedup.sweep().await {
                                tracing::error!(error = %e, "Scheduled DNS sweep failed");
                            }
                        })
                    })
                }
                Task::CloudLists(providers) => {
                    let cloud = cloud.clone();
                    Job::new_repeated_async(scheduled.every, move |_id, _lock| {
                        let cloud = cloud.clone();
                        let providers = providers.clone();
                        Box::pin(async move {
                            // Failures are logged per provider.
                            cloud.refresh_all(&providers).await;
                        })
                    })
                }
            }
            .with_context(|| format!("Failed to build job for {:?}", scheduled.task))?;
            inner.add(job).await.context("Failed to register job")?;
        }

        inner.start().await.context("Failed to start scheduler")?;
        tracing::info!(jobs = tasks.len(), "Scheduler started");
        Ok(Self {
            inner,
            jobs: tasks.len(),
        })
    }

    pub fn job_count(&self) -> usize {
        self.jobs
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner.shutdown().await.context("Failed to stop scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;

    #[test]
    fn plans_only_sources_with_intervals() {
        let mut every_hour = SourceConfig::new("Hourly", "https://x/1");
        every_hour.schedule_interval_minutes = Some(60);
        let mut disabled = SourceConfig::new("Off", "https://x/2");
        disabled.schedule_interval_minutes = Some(5);
        disabled.enabled = false;
        let manual = SourceConfig::new("Manual", "https://x/3");

        let mut config = AppConfig {
            sources: vec![every_hour, disabled, manual],
            ..Default::default()
        };
        config.dns.sweep_interval_minutes = Some(0);
        // An interval without providers schedules nothing.
        config.cloud.interval_minutes = Some(720);

        assert_eq!(
            plan(&config),
            vec![
                ScheduledTask {
                    task: Task::Source("Hourly".to_string()),
                    every: Duration::from_secs(3600),
                },
                ScheduledTask {
                    task: Task::DnsSweep,
                    every: Duration::from_secs(60),
                },
            ]
        );
    }

    #[test]
    fn plans_cloud_refresh_for_configured_providers() {
        let mut config = AppConfig::default();
        config.cloud.interval_minutes = Some(720);
        config.cloud.providers = vec![CloudProvider::Github, CloudProvider::Azure];
        assert_eq!(
            plan(&config),
            vec![ScheduledTask {
                task: Task::CloudLists(vec![CloudProvider::Github, CloudProvider::Azure]),
                every: Duration::from_secs(720 * 60),
            }]
        );
    }
}
