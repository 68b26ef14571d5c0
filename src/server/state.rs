use crate::jobs::Scheduler;
use crate::settings::Settings;

#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) settings: Settings,
    pub(crate) scheduler: Scheduler,
}
