use super::rules::{
    ContainerReplicaRule, HealthyPipelineRule, MinDatanodesRule, OneReplicaPipelineRule,
    SafeModeRule, SafeModeSample, MIN_DATANODE_RULE,
};
use crate::events::{EventBus, SafeModeStatus, ScmEvent};
use log::info;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct SafeModeConfig {
    pub enabled: bool,
    pub min_datanodes: usize,
    pub container_threshold: f64,
    pub pipeline_availability_check: bool,
    pub pipeline_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct RuleStatus {
    pub name: &'static str,
    pub passed: bool,
    pub text: String,
}

/// Multi-rule admission barrier. Pre-check rules gate read traffic; the full
/// rule set gates the safe-mode exit. The exit is one-way per process
/// lifetime: later rule regressions never re-enter safe mode.
pub struct SafeModeManager {
    enabled: bool,
    in_safe_mode: AtomicBool,
    pre_check_complete: AtomicBool,
    rules: Mutex<Vec<Box<dyn SafeModeRule>>>,
    pre_check_rules: HashSet<&'static str>,
    validated: Mutex<HashSet<&'static str>>,
    bus: EventBus,
}

impl SafeModeManager {
    pub fn new(config: SafeModeConfig, bus: EventBus) -> Self {
        let mut rules: Vec<Box<dyn SafeModeRule>> = vec![
            Box::new(MinDatanodesRule::new(config.min_datanodes)),
            Box::new(ContainerReplicaRule::new(config.container_threshold)),
        ];
        if config.pipeline_availability_check {
            rules.push(Box::new(HealthyPipelineRule::new(config.pipeline_threshold)));
            rules.push(Box::new(OneReplicaPipelineRule::new()));
        }
        let mut pre_check_rules = HashSet::new();
        pre_check_rules.insert(MIN_DATANODE_RULE);

        let manager = Self {
            enabled: config.enabled,
            in_safe_mode: AtomicBool::new(true),
            pre_check_complete: AtomicBool::new(false),
            rules: Mutex::new(rules),
            pre_check_rules,
            validated: Mutex::new(HashSet::new()),
            bus,
        };
        if !manager.enabled {
            manager.exit_safe_mode();
        }
        manager
    }

    pub fn status(&self) -> SafeModeStatus {
        SafeModeStatus {
            in_safe_mode: self.in_safe_mode(),
            pre_check_complete: self.pre_check_complete.load(Ordering::SeqCst),
        }
    }

    pub fn in_safe_mode(&self) -> bool {
        if !self.enabled {
            return false;
        }
        self.in_safe_mode.load(Ordering::SeqCst)
    }

    pub fn pre_check_complete(&self) -> bool {
        self.pre_check_complete.load(Ordering::SeqCst)
    }

    /// Re-evaluates every rule against a fresh sample. Called after every
    /// registration, pipeline report, and container report.
    pub fn refresh_and_validate(&self, sample: &SafeModeSample) -> SafeModeStatus {
        if !self.in_safe_mode() {
            return self.status();
        }
        let (rule_count, newly_validated) = {
            let mut rules = self.rules.lock();
            let mut validated = self.validated.lock();
            for rule in rules.iter_mut() {
                rule.refresh(sample);
                if rule.validate() && validated.insert(rule.name()) {
                    info!("event=safemode_rule_validated rule={}", rule.name());
                }
            }
            (rules.len(), validated.clone())
        };

        if !self.pre_check_complete() {
            let pre_check_passed = self
                .pre_check_rules
                .iter()
                .all(|rule| newly_validated.contains(rule));
            if pre_check_passed {
                self.complete_pre_check();
            }
        }
        if newly_validated.len() == rule_count {
            info!("event=safemode_all_rules_validated");
            self.exit_safe_mode();
        }
        self.status()
    }

    /// Per-rule standing for the admin surface.
    pub fn rule_status(&self) -> Vec<RuleStatus> {
        self.rules
            .lock()
            .iter()
            .map(|rule| RuleStatus {
                name: rule.name(),
                passed: rule.validate(),
                text: rule.status_text(),
            })
            .collect()
    }

    fn complete_pre_check(&self) {
        info!("event=safemode_pre_check_complete");
        self.pre_check_complete.store(true, Ordering::SeqCst);
        self.bus.publish(ScmEvent::PreCheckComplete);
        self.emit_status();
    }

    fn exit_safe_mode(&self) {
        info!("event=safemode_exit");
        self.pre_check_complete.store(true, Ordering::SeqCst);
        self.in_safe_mode.store(false, Ordering::SeqCst);
        self.emit_status();
    }

    fn emit_status(&self) {
        self.bus.publish(ScmEvent::SafeModeStatus(self.status()));
    }
}
