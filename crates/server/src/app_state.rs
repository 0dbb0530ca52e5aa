use fanout::FanoutCore;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) core: FanoutCore,
    pub(crate) max_body_bytes: usize,
}
