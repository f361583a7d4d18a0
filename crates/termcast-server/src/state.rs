use std::sync::Arc;

use termcast_config::Config;
use termcast_control::ControlPlane;
use termcast_federation::HqRegistry;
use termcast_recording::RecordingStore;
use termcast_registry::SessionRegistry;
use termcast_renderer::TerminalRenderer;
use termcast_watcher::StreamWatcher;

/// Everything a handler needs, wired together once at startup in
/// `termcast-cli` and shared behind an `Arc`.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub control: ControlPlane,
    pub watcher: StreamWatcher,
    pub renderer: TerminalRenderer,
    pub recordings: RecordingStore,
    /// Present only when this node runs as an HQ (§4.H); `None` on a
    /// plain Remote/standalone node.
    pub federation: Option<HqRegistry>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        registry: SessionRegistry,
        watcher: StreamWatcher,
        renderer: TerminalRenderer,
        recordings: RecordingStore,
        federation: Option<HqRegistry>,
    ) -> Arc<Self> {
        let control = ControlPlane::new(registry.clone());
        Arc::new(Self {
            config,
            registry,
            control,
            watcher,
            renderer,
            recordings,
            federation,
        })
    }
}
