use crate::config::BillingPeriod;
use crate::models::{ModelUsage, UsageEntry, UsageStats};

#[derive(Debug, Clone)]
pub struct DashboardView {
    pub stats: Option<UsageStats>,
    pub billing_period: BillingPeriod,
    pub models: Vec<(String, ModelUsage)>,
    pub recent: Vec<UsageEntry>,
    pub last_refresh: String,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            stats: None,
            billing_period: BillingPeriod::Monthly,
            models: vec![],
            recent: vec![],
            last_refresh: "never".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Dashboard,
    Confirm(ConfirmAction),
    ErrorDialog,
    InfoDialog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmAction {
    Quit,
    Cleanup,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub status: String,
    pub compact_mode: bool,
    pub view: DashboardView,
    pub screen: Screen,
    pub previous_screen: Screen,
    pub action_focused: bool,
    pub action_selected: usize,
    pub confirm_selected: usize,
    pub error_message: String,
    pub info_message: String,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: true,
            status: "ready".into(),
            compact_mode: false,
            view: DashboardView::default(),
            screen: Screen::Dashboard,
            previous_screen: Screen::Dashboard,
            action_focused: false,
            action_selected: 0,
            confirm_selected: 0,
            error_message: String::new(),
            info_message: String::new(),
        }
    }
}
