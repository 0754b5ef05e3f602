/// Best-effort desktop notification sink.
pub trait Notifier: Send + Sync {
    fn app_has_focus(&self) -> bool;
    fn notify(&self, title: &str, body: &str);
}

/// Reports the application as always focused, so nothing is ever sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn app_has_focus(&self) -> bool {
        true
    }

    fn notify(&self, _title: &str, _body: &str) {}
}
