use crate::lifecycle::LifecycleManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: LifecycleManager,
}
