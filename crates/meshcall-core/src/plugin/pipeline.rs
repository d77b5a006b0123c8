use super::{DialContext, HookResult, Plugin};
use crate::error::{HookStage, MeshError, Result};
use crate::proto::Message;
use crate::session::SessionInfo;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Ordered chain of plugins for one endpoint.
///
/// Built once by the endpoint builder and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PluginPipeline {
    /// Build a pipeline, rejecting duplicate plugin names.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for plugin in &plugins {
            if !seen.insert(plugin.name().to_string()) {
                return Err(MeshError::config(format!(
                    "duplicate plugin name: {}",
                    plugin.name()
                )));
            }
        }
        Ok(Self { plugins })
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Plugin names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn before_dial(&self, ctx: &mut DialContext) -> Result<()> {
        let original = ctx.addr.clone();
        for plugin in &self.plugins {
            if let Some(observer) = plugin.as_dial_observer() {
                check(plugin.as_ref(), HookStage::BeforeDial, observer.before_dial(ctx))?;
            }
        }
        if ctx.addr != original {
            debug!("Dial target rewritten by plugins: {} -> {}", original, ctx.addr);
        }
        Ok(())
    }

    pub fn after_dial(&self, session: &SessionInfo) -> Result<()> {
        for plugin in &self.plugins {
            if let Some(observer) = plugin.as_dial_observer() {
                check(plugin.as_ref(), HookStage::AfterDial, observer.after_dial(session))?;
            }
        }
        Ok(())
    }

    pub fn before_write(&self, message: &mut Message) -> Result<()> {
        for plugin in &self.plugins {
            if let Some(observer) = plugin.as_call_observer() {
                check(plugin.as_ref(), HookStage::BeforeWrite, observer.before_write(message))?;
            }
        }
        Ok(())
    }

    pub fn after_read(&self, message: &mut Message) -> Result<()> {
        for plugin in &self.plugins {
            if let Some(observer) = plugin.as_call_observer() {
                check(plugin.as_ref(), HookStage::AfterRead, observer.after_read(message))?;
            }
        }
        Ok(())
    }

    pub fn session_create(&self, session: &SessionInfo) -> Result<()> {
        for plugin in &self.plugins {
            if let Some(observer) = plugin.as_session_observer() {
                check(
                    plugin.as_ref(),
                    HookStage::SessionCreate,
                    observer.on_session_create(session),
                )?;
            }
        }
        Ok(())
    }

    /// Notify every session observer; never aborts.
    pub fn session_close(&self, session: &SessionInfo) {
        for plugin in &self.plugins {
            if let Some(observer) = plugin.as_session_observer() {
                observer.on_session_close(session);
            }
        }
    }
}

fn check(plugin: &dyn Plugin, stage: HookStage, outcome: HookResult) -> Result<()> {
    outcome.map_err(|reason| {
        warn!("Plugin {} aborted at {}: {}", plugin.name(), stage, reason);
        MeshError::HookAborted {
            plugin: plugin.name().to_string(),
            stage,
            reason,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{CallObserver, DialObserver, StaticMeta};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        reject: bool,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn as_call_observer(&self) -> Option<&dyn CallObserver> {
            Some(self)
        }

        fn as_dial_observer(&self) -> Option<&dyn DialObserver> {
            Some(self)
        }
    }

    impl CallObserver for Recorder {
        fn before_write(&self, message: &mut Message) -> HookResult {
            self.log.lock().unwrap().push(self.name.to_string());
            message.meta.insert(self.name.to_string(), "seen".into());
            if self.reject {
                Err("rejected".into())
            } else {
                Ok(())
            }
        }
    }

    impl DialObserver for Recorder {
        fn before_dial(&self, ctx: &mut DialContext) -> HookResult {
            ctx.addr.push_str("-x");
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, reject: bool) -> Arc<dyn Plugin> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            reject,
        })
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            recorder("first", &log, false),
            recorder("second", &log, false),
        ])
        .unwrap();

        let mut message = Message::call(1, "/a/b", b'j', Vec::new());
        pipeline.before_write(&mut message).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(message.meta.len(), 2);
    }

    #[test]
    fn test_first_abort_stops_pipeline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            recorder("auth", &log, true),
            recorder("after", &log, false),
        ])
        .unwrap();

        let mut message = Message::call(1, "/a/b", b'j', Vec::new());
        let err = pipeline.before_write(&mut message).unwrap_err();

        match err {
            MeshError::HookAborted { plugin, stage, reason } => {
                assert_eq!(plugin, "auth");
                assert_eq!(stage, HookStage::BeforeWrite);
                assert_eq!(reason, "rejected");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["auth"]);
    }

    #[test]
    fn test_before_dial_mutations_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new(vec![
            recorder("a", &log, false),
            Arc::new(StaticMeta::new("meta")),
            recorder("b", &log, false),
        ])
        .unwrap();

        let mut ctx = DialContext {
            addr: "127.0.0.1:1".into(),
        };
        pipeline.before_dial(&mut ctx).unwrap();
        assert_eq!(ctx.addr, "127.0.0.1:1-x-x");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = PluginPipeline::new(vec![
            Arc::new(StaticMeta::new("dup")) as Arc<dyn Plugin>,
            Arc::new(StaticMeta::new("dup")),
        ])
        .unwrap_err();
        assert!(matches!(err, MeshError::Config { .. }));
    }
}
