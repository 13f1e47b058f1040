//! Experiment-tracking configuration.
//!
//! Tracking settings come from explicit flags or from the conventional
//! `WANDB_*` environment variables. They are resolved once at startup into
//! plain values; an explicit flag always wins over the environment.

/// Resolved experiment-tracking settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingConfig {
    /// Tracking project name. Tracking is enabled iff this is set.
    pub project: Option<String>,
    /// Run name within the project.
    pub run_name: Option<String>,
    /// Gradient/parameter watch mode.
    pub watch: Option<String>,
    /// Whether to upload model artifacts ("true"/"false"/"checkpoint").
    pub log_model: Option<String>,
}

impl TrackingConfig {
    /// Resolves flags against the process environment.
    #[must_use]
    pub fn resolve(
        project: Option<String>,
        run_name: Option<String>,
        watch: Option<String>,
        log_model: Option<String>,
    ) -> Self {
        Self::resolve_with(project, run_name, watch, log_model, |key| {
            std::env::var(key).ok()
        })
    }

    /// Resolves flags against an arbitrary environment lookup.
    #[must_use]
    pub fn resolve_with(
        project: Option<String>,
        run_name: Option<String>,
        watch: Option<String>,
        log_model: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let pick = |flag: Option<String>, key: &str| {
            flag.filter(|v| !v.is_empty())
                .or_else(|| lookup(key).filter(|v| !v.is_empty()))
        };
        Self {
            project: pick(project, "WANDB_PROJECT"),
            run_name: pick(run_name, "WANDB_RUN_NAME"),
            watch: pick(watch, "WANDB_WATCH"),
            log_model: pick(log_model, "WANDB_LOG_MODEL"),
        }
    }

    /// Returns `true` when a tracking project was configured.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.project.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(key: &str) -> Option<String> {
        match key {
            "WANDB_PROJECT" => Some("env-project".to_string()),
            "WANDB_WATCH" => Some("gradients".to_string()),
            _ => None,
        }
    }

    #[test]
    fn flag_wins_over_env() {
        let cfg = TrackingConfig::resolve_with(
            Some("flag-project".to_string()),
            None,
            None,
            None,
            env,
        );
        assert_eq!(cfg.project.as_deref(), Some("flag-project"));
        assert_eq!(cfg.watch.as_deref(), Some("gradients"));
        assert!(cfg.enabled());
    }

    #[test]
    fn empty_flag_falls_back_to_env() {
        let cfg = TrackingConfig::resolve_with(Some(String::new()), None, None, None, env);
        assert_eq!(cfg.project.as_deref(), Some("env-project"));
    }

    #[test]
    fn disabled_without_project() {
        let cfg = TrackingConfig::resolve_with(None, None, None, None, |_| None);
        assert!(!cfg.enabled());
    }
}
