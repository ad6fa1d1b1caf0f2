use iced::futures::channel::mpsc;
use iced::futures::SinkExt;
use iced::keyboard;
use iced::widget::canvas::Canvas;
use iced::widget::{button, column, container, row, scrollable, text, text_input, Column, Row, Space};
use iced::{Alignment, Background, Border, Color, Element, Font, Length, Shadow, Subscription, Task, Theme, Vector};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::chart::{ChartColors, ChartSeries, TimeChart, YAxis};
use crate::config::Settings;
use crate::controller::{FetchTicket, View, ViewController};
use crate::error::DashboardError;
use crate::gauge::{GaugeColors, PercentGauge, Sparkline};
use crate::history::{BufferLifetime, MetricHistory, WindowStats};
use crate::metrics::{MetricCategory, MetricsData, Normalizer};
use crate::ringbuf::{time_label, SeriesPoint};
use crate::session::{Session, SessionStore};
use crate::theme::{build_palette, AccentColor, Palette, ThemeVariant};
use crate::transport::{
    AuthApi, ChannelEvent, Delivery, MetricsApi, PushChannel, PushConfig, RegisterRequest,
    Subscription as TopicSubscription,
};

const MONO: Font = Font::MONOSPACE;
const FEED_QUEUE: usize = 64;
const THRESHOLD_OPTIONS: &[f64] = &[70.0, 80.0, 90.0, 95.0];

/// Send a desktop notification (non-blocking, best-effort).
fn send_notification(title: &str, body: &str) {
    let _ = notify_rust::Notification::new()
        .summary(title)
        .body(body)
        .appname("Vigil")
        .timeout(notify_rust::Timeout::Milliseconds(5000))
        .show();
}

// ─── MESSAGE & ENUMS ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Message {
    // Sign-in
    UsernameChanged(String),
    EmailChanged(String),
    PasswordChanged(String),
    ToggleRegister,
    SubmitLogin,
    LoggedIn(Result<Session, DashboardError>),
    Registered(Result<Option<Session>, DashboardError>),
    Logout,
    LoggedOut(Result<(), DashboardError>),
    // Metrics
    SwitchView(View),
    Refresh,
    SnapshotLoaded(FetchTicket, Result<MetricsData, DashboardError>),
    Frame(MetricsData),
    Channel(ChannelEvent),
    Reconnect,
    DismissError,
    // Settings
    ToggleSettings,
    SetTheme(ThemeVariant),
    SetAccent(AccentColor),
    SetBufferLifetime(BufferLifetime),
    ToggleNotifications,
    SetCpuAlertThreshold(f64),
    SetMemAlertThreshold(f64),
    // Keyboard
    KeyPressed(keyboard::Key, keyboard::Modifiers),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Login,
    Dashboard,
}

/// What the header shows about the live feed.
#[derive(Debug, Clone, PartialEq)]
enum FeedStatus {
    Connecting,
    Live,
    Reconnecting { attempt: u32, max: u32 },
    /// Automatic reconnects are exhausted.
    Lost,
}

impl FeedStatus {
    fn label(&self) -> String {
        match self {
            FeedStatus::Connecting => "connecting".into(),
            FeedStatus::Live => "live".into(),
            FeedStatus::Reconnecting { attempt, max } => format!("reconnecting {attempt}/{max}"),
            FeedStatus::Lost => "offline".into(),
        }
    }
}

#[derive(Debug, Default)]
struct LoginForm {
    username: String,
    email: String,
    password: String,
    registering: bool,
    busy: bool,
    error: Option<String>,
    notice: Option<String>,
}

// ─── APP STATE ──────────────────────────────────────────────────

pub struct Vigil {
    settings: Settings,
    settings_path: PathBuf,
    pal: Palette,
    store: SessionStore,
    auth: AuthApi,
    api: MetricsApi,
    /// Shared by the pull and push paths so receipt timestamps stay ordered.
    normalizer: Arc<Normalizer>,
    controller: ViewController,
    screen: Screen,
    session: Option<Session>,
    login: LoginForm,
    /// Part of the push subscription id. Bumping it restarts the feed.
    feed_epoch: u64,
    feed: FeedStatus,
    show_settings: bool,
}

impl Vigil {
    /// Build the app from loaded settings. Starts on the dashboard when the
    /// store already holds a session.
    pub fn boot(
        settings: Settings,
        settings_path: PathBuf,
        store: SessionStore,
    ) -> Result<(Self, Task<Message>), DashboardError> {
        let auth = AuthApi::from_settings(&settings, store.clone())?;
        let normalizer = Arc::new(Normalizer::new());
        let api = MetricsApi::with_normalizer(auth.clone(), Arc::clone(&normalizer));

        let mut app = Self {
            pal: build_palette(settings.theme, settings.accent),
            controller: ViewController::from_settings(&settings),
            settings,
            settings_path,
            store,
            auth,
            api,
            normalizer,
            screen: Screen::Login,
            session: None,
            login: LoginForm::default(),
            feed_epoch: 0,
            feed: FeedStatus::Connecting,
            show_settings: false,
        };

        let task = match app.store.load().filter(Session::is_authenticated) {
            Some(session) => {
                info!(user = %session.username, "resuming stored session");
                app.enter_dashboard(session)
            }
            None => Task::none(),
        };
        Ok((app, task))
    }

    pub fn title(&self) -> String {
        match self.screen {
            Screen::Login => String::from("Vigil"),
            Screen::Dashboard => format!("Vigil - {}", self.controller.view()),
        }
    }

    pub fn theme(&self) -> Theme {
        self.settings.theme.iced_theme()
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn controller(&self) -> &ViewController {
        &self.controller
    }

    pub fn subscription(&self) -> Subscription<Message> {
        let keys = keyboard::on_key_press(|key, modifiers| Some(Message::KeyPressed(key, modifiers)));
        if self.screen != Screen::Dashboard {
            return keys;
        }
        Subscription::batch([keys, self.push_feed()])
    }

    /// The live metrics feed. Dropped (and the channel closed) as soon as the
    /// dashboard is left.
    fn push_feed(&self) -> Subscription<Message> {
        let config = self.settings.push_config();
        let topic = self.settings.metrics_topic.clone();
        let store = self.store.clone();
        let normalizer = Arc::clone(&self.normalizer);
        Subscription::run_with_id(
            ("push-feed", self.feed_epoch),
            iced::stream::channel(FEED_QUEUE, move |output| run_feed(config, topic, store, normalizer, output)),
        )
    }

    pub fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::UsernameChanged(v) => {
                self.login.username = v;
                Task::none()
            }
            Message::EmailChanged(v) => {
                self.login.email = v;
                Task::none()
            }
            Message::PasswordChanged(v) => {
                self.login.password = v;
                Task::none()
            }
            Message::ToggleRegister => {
                self.login.registering = !self.login.registering;
                self.login.error = None;
                self.login.notice = None;
                Task::none()
            }
            Message::SubmitLogin => self.submit_login(),
            Message::LoggedIn(Ok(session)) => {
                self.login = LoginForm::default();
                self.enter_dashboard(session)
            }
            Message::LoggedIn(Err(e)) => {
                self.login.busy = false;
                self.login.error = Some(e.to_string());
                Task::none()
            }
            Message::Registered(Ok(Some(session))) => {
                self.login = LoginForm::default();
                self.enter_dashboard(session)
            }
            Message::Registered(Ok(None)) => {
                let username = std::mem::take(&mut self.login.username);
                self.login = LoginForm {
                    username,
                    notice: Some("Account created, sign in to continue".into()),
                    ..LoginForm::default()
                };
                Task::none()
            }
            Message::Registered(Err(e)) => {
                self.login.busy = false;
                self.login.error = Some(e.to_string());
                Task::none()
            }
            Message::Logout => {
                self.leave_dashboard();
                let auth = self.auth.clone();
                Task::perform(async move { auth.logout().await }, Message::LoggedOut)
            }
            Message::LoggedOut(result) => {
                if let Err(e) = result {
                    warn!(error = %e, "sign-out did not complete cleanly");
                }
                Task::none()
            }
            Message::SwitchView(view) => {
                self.show_settings = false;
                match self.controller.begin_switch(view) {
                    Ok(Some(ticket)) => self.fetch(ticket),
                    Ok(None) => Task::none(),
                    Err(e) => {
                        debug!(%view, error = %e, "view switch ignored");
                        Task::none()
                    }
                }
            }
            Message::Refresh => match self.controller.view().category() {
                Some(category) => match self.controller.begin_fetch(category) {
                    Ok(ticket) => self.fetch(ticket),
                    Err(_) => Task::none(),
                },
                None => self.prime(),
            },
            Message::SnapshotLoaded(ticket, result) => {
                let expired = result.as_ref().err().filter(|e| e.requires_login()).cloned();
                if self.controller.complete(ticket, result) {
                    if let Some(e) = expired {
                        return self.expire_session(e);
                    }
                }
                Task::none()
            }
            Message::Frame(data) => {
                if self.screen == Screen::Dashboard {
                    self.controller.apply_push(&data);
                }
                Task::none()
            }
            Message::Channel(event) => {
                self.on_channel_event(event);
                Task::none()
            }
            Message::Reconnect => {
                info!("manual reconnect requested");
                self.feed_epoch += 1;
                self.feed = FeedStatus::Connecting;
                Task::none()
            }
            Message::DismissError => {
                self.controller.dismiss_error();
                Task::none()
            }
            Message::ToggleSettings => {
                self.show_settings = !self.show_settings;
                Task::none()
            }
            Message::SetTheme(theme) => {
                self.settings.theme = theme;
                self.pal = build_palette(theme, self.settings.accent);
                self.save_settings();
                Task::none()
            }
            Message::SetAccent(accent) => {
                self.settings.accent = accent;
                self.pal = build_palette(self.settings.theme, accent);
                self.save_settings();
                Task::none()
            }
            Message::SetBufferLifetime(lifetime) => {
                if lifetime != self.settings.buffer_lifetime {
                    self.settings.buffer_lifetime = lifetime;
                    self.controller.reconfigure(&self.settings);
                    self.save_settings();
                }
                Task::none()
            }
            Message::ToggleNotifications => {
                self.settings.notifications = !self.settings.notifications;
                self.save_settings();
                Task::none()
            }
            Message::SetCpuAlertThreshold(v) => {
                self.settings.cpu_alert_threshold = v;
                self.save_settings();
                Task::none()
            }
            Message::SetMemAlertThreshold(v) => {
                self.settings.mem_alert_threshold = v;
                self.save_settings();
                Task::none()
            }
            Message::KeyPressed(key, _modifiers) => self.on_key(key),
        }
    }

    fn on_key(&mut self, key: keyboard::Key) -> Task<Message> {
        use keyboard::key::Named;
        if self.screen != Screen::Dashboard {
            return Task::none();
        }
        match key {
            keyboard::Key::Character(ref c) => match c.as_str() {
                "1" => self.update(Message::SwitchView(View::Overview)),
                "2" => self.update(Message::SwitchView(View::DetailCpu)),
                "3" => self.update(Message::SwitchView(View::DetailMemory)),
                "4" => self.update(Message::SwitchView(View::DetailThread)),
                "r" => self.update(Message::Refresh),
                "s" | "," => self.update(Message::ToggleSettings),
                _ => Task::none(),
            },
            keyboard::Key::Named(Named::Escape) => {
                if self.show_settings {
                    self.show_settings = false;
                } else {
                    self.controller.dismiss_error();
                }
                Task::none()
            }
            _ => Task::none(),
        }
    }

    fn submit_login(&mut self) -> Task<Message> {
        if self.login.busy {
            return Task::none();
        }
        let username = self.login.username.trim().to_string();
        if username.is_empty() || self.login.password.is_empty() {
            self.login.error = Some("Username and password are required".into());
            return Task::none();
        }
        self.login.busy = true;
        self.login.error = None;
        self.login.notice = None;

        let auth = self.auth.clone();
        let password = self.login.password.clone();
        if self.login.registering {
            let request = RegisterRequest {
                username,
                email: self.login.email.trim().to_string(),
                password,
                role: None,
            };
            return Task::perform(async move { auth.register(&request).await }, Message::Registered);
        }
        Task::perform(async move { auth.login(&username, &password).await }, Message::LoggedIn)
    }

    fn enter_dashboard(&mut self, session: Session) -> Task<Message> {
        self.session = Some(session);
        self.screen = Screen::Dashboard;
        self.feed_epoch += 1;
        self.feed = FeedStatus::Connecting;
        self.prime()
    }

    /// Unsubscribe and drop everything tied to the signed-in session.
    fn leave_dashboard(&mut self) {
        self.controller.teardown();
        self.screen = Screen::Login;
        self.session = None;
        self.show_settings = false;
    }

    fn expire_session(&mut self, error: DashboardError) -> Task<Message> {
        warn!(%error, "session ended, returning to sign-in");
        self.leave_dashboard();
        self.login.error = Some(error.to_string());
        if self.settings.notifications {
            send_notification("Vigil: Session expired", "Sign in again to resume monitoring.");
        }
        Task::none()
    }

    /// Fill the dashboard with one aggregate snapshot instead of waiting for
    /// the first push frame.
    fn prime(&mut self) -> Task<Message> {
        match self.controller.begin_fetch_all() {
            Ok(ticket) => self.fetch(ticket),
            Err(e) => {
                debug!(error = %e, "overview refresh ignored");
                Task::none()
            }
        }
    }

    fn fetch(&self, ticket: FetchTicket) -> Task<Message> {
        let api = self.api.clone();
        Task::perform(
            async move { ticket.scope().fetch(&api).await },
            move |r| Message::SnapshotLoaded(ticket, r),
        )
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        if self.screen != Screen::Dashboard {
            return;
        }
        self.controller.on_channel_event(&event);
        match &event {
            ChannelEvent::Connected => self.feed = FeedStatus::Live,
            ChannelEvent::Reconnecting { attempt, max, .. } => {
                self.feed = FeedStatus::Reconnecting { attempt: *attempt, max: *max };
            }
            ChannelEvent::Disconnected { .. } => {
                if self.feed == FeedStatus::Live {
                    self.feed = FeedStatus::Connecting;
                }
            }
            ChannelEvent::Failed { error } => {
                self.feed = FeedStatus::Lost;
                if self.settings.notifications {
                    send_notification("Vigil: Live feed lost", &error.to_string());
                }
            }
            ChannelEvent::ServerError { .. } => {}
        }
    }

    fn save_settings(&self) {
        if let Err(e) = self.settings.save_to(&self.settings_path) {
            warn!(path = %self.settings_path.display(), error = %e, "failed to save settings");
        }
    }

    fn chart_colors(&self) -> ChartColors {
        let p = &self.pal;
        ChartColors { bg: p.panel_bg, border: p.border, grid: p.grid, label: p.label, text: p.text }
    }

    fn gauge_colors(&self) -> GaugeColors {
        let p = &self.pal;
        GaugeColors { bg: p.panel_bg, label: p.label, text: p.text, track: p.bar_bg }
    }

    // ─── VIEW ──────────────────────────────────────────────────

    pub fn view(&self) -> Element<'_, Message> {
        let content = match self.screen {
            Screen::Login => self.view_login(),
            Screen::Dashboard => self.view_dashboard(),
        };
        let bg = self.pal.bg;
        container(content)
            .width(Length::Fill)
            .height(Length::Fill)
            .style(move |_: &Theme| container::Style {
                background: Some(Background::Color(bg)),
                ..Default::default()
            })
            .into()
    }

    fn view_login(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let form = &self.login;

        let mut fields = column![
            text("Vigil").size(22).font(MONO).color(p.accent),
            text(if form.registering { "Create an account" } else { "Sign in to the monitoring server" })
                .size(12)
                .color(p.label),
            Space::with_height(8),
            text_input("Username", &form.username)
                .on_input(Message::UsernameChanged)
                .on_submit(Message::SubmitLogin)
                .padding(8)
                .size(13),
        ]
        .spacing(8);

        if form.registering {
            fields = fields.push(
                text_input("Email", &form.email)
                    .on_input(Message::EmailChanged)
                    .on_submit(Message::SubmitLogin)
                    .padding(8)
                    .size(13),
            );
        }
        fields = fields.push(
            text_input("Password", &form.password)
                .on_input(Message::PasswordChanged)
                .on_submit(Message::SubmitLogin)
                .secure(true)
                .padding(8)
                .size(13),
        );

        let submit_label = match (form.busy, form.registering) {
            (true, _) => "Please wait...",
            (false, true) => "Register",
            (false, false) => "Sign in",
        };
        fields = fields.push(
            button(container(text(submit_label).size(13)).center_x(Length::Fill))
                .on_press_maybe((!form.busy).then_some(Message::SubmitLogin))
                .style(button::primary)
                .padding([6, 18])
                .width(Length::Fill),
        );
        fields = fields.push(
            button(
                text(if form.registering { "Have an account? Sign in" } else { "No account? Register" })
                    .size(11)
                    .color(p.accent),
            )
            .on_press(Message::ToggleRegister)
            .style(button::text)
            .padding([2, 0]),
        );

        if let Some(err) = &form.error {
            fields = fields.push(text(err).size(11).color(p.alert));
        }
        if let Some(notice) = &form.notice {
            fields = fields.push(text(notice).size(11).color(p.ok));
        }
        fields = fields.push(Space::with_height(4));
        fields = fields.push(text(self.settings.api_base_url.as_str()).size(10).font(MONO).color(p.label));

        container(container(panel(fields.into(), p)).width(340))
            .center_x(Length::Fill)
            .center_y(Length::Fill)
            .into()
    }

    fn view_dashboard(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let busy = self.controller.is_busy();
        let current = self.controller.view();

        let tabs = Row::with_children(
            View::ALL.iter().map(|&v| menu_tab(v.to_string(), v, current, busy, p)),
        )
        .spacing(4);

        let feed_color = match self.feed {
            FeedStatus::Live => p.ok,
            FeedStatus::Connecting | FeedStatus::Reconnecting { .. } => p.warn,
            FeedStatus::Lost => p.alert,
        };
        let reconnect: Element<Message> = if self.feed == FeedStatus::Lost {
            button(text("reconnect").size(11).color(p.accent))
                .on_press(Message::Reconnect)
                .style(button::text)
                .padding([2, 6])
                .into()
        } else {
            Space::new(0, 0).into()
        };

        let loading: Element<Message> = match self.controller.loading() {
            Some(scope) => text(format!("loading {scope}...")).size(11).color(p.label).into(),
            None => Space::new(0, 0).into(),
        };

        let updated = self
            .controller
            .last_update()
            .map(|ts| format!("updated {}", time_label(ts)))
            .unwrap_or_else(|| "no data yet".into());
        let user = self.session.as_ref().map(|s| s.username.clone()).unwrap_or_default();

        let menu_bar = row![
            button(text("Vigil").size(15).color(p.accent))
                .on_press(Message::ToggleSettings)
                .style(button::text)
                .padding([2, 4]),
            Space::with_width(8),
            text("\u{25cf}").size(11).color(feed_color),
            text(self.feed.label()).size(11).font(MONO).color(p.label),
            reconnect,
            Space::with_width(8),
            loading,
            Space::with_width(Length::Fill),
            tabs,
            Space::with_width(Length::Fill),
            text(updated).size(11).font(MONO).color(p.label),
            Space::with_width(12),
            text(user).size(11).color(p.text),
            button(text("sign out").size(11).color(p.accent))
                .on_press(Message::Logout)
                .style(button::text)
                .padding([2, 6]),
        ]
        .spacing(4)
        .align_y(Alignment::Center)
        .padding([6, 12]);

        let content: Element<Message> = if self.show_settings {
            self.view_settings()
        } else {
            match current {
                View::Overview => self.view_overview(),
                View::DetailCpu => self.view_detail_cpu(),
                View::DetailMemory => self.view_detail_memory(),
                View::DetailThread => self.view_detail_threads(),
            }
        };

        column![
            panel_bg(menu_bar.into(), p.panel_bg, p.border),
            self.view_error_banner(),
            scrollable(container(content).width(Length::Fill).padding(8)).height(Length::Fill),
        ]
        .spacing(0)
        .into()
    }

    fn view_error_banner(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let message = match self.controller.last_error() {
            Some(err) => match err.during {
                Some(view) => format!("Could not open {view}: {}", err.message()),
                None => err.message(),
            },
            None => return Space::new(0, 0).into(),
        };
        let alert = p.alert;
        container(
            row![
                text(message).size(11).color(alert),
                Space::with_width(Length::Fill),
                button(text("dismiss").size(10).color(p.label))
                    .on_press(Message::DismissError)
                    .style(button::text)
                    .padding([1, 6]),
            ]
            .align_y(Alignment::Center),
        )
        .width(Length::Fill)
        .padding([4, 12])
        .style(move |_: &Theme| container::Style {
            background: Some(Background::Color(Color { a: 0.12, ..alert })),
            ..Default::default()
        })
        .into()
    }

    // ─── OVERVIEW ──────────────────────────────────────────────

    fn view_overview(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let h = self.controller.overview_history();
        let busy = self.controller.is_busy();

        if h.is_empty() {
            return container(text("Waiting for metrics...").size(14).font(MONO).color(p.label))
                .center_x(Length::Fill)
                .padding(60)
                .into();
        }

        let cpu = h.cpu().latest();
        let cpu_pct = cpu.map_or(0.0, |s| s.system_pct);
        let cpu_gauge = Canvas::new(PercentGauge {
            value: cpu_pct as f32,
            label: "system".into(),
            caption: cpu.map(|s| format!("process {:.1}%", s.process_pct)),
            color: alert_color(cpu_pct, self.settings.cpu_alert_threshold, p.accent, p),
            colors: self.gauge_colors(),
        })
        .width(Length::Fill)
        .height(Length::Fixed(170.0));

        let mem = h.memory().latest();
        let mem_pct = mem.map_or(0.0, |s| s.percentage);
        let mem_gauge = Canvas::new(PercentGauge {
            value: mem_pct as f32,
            label: "heap".into(),
            caption: mem.map(|s| format!("{} / {}", format_mb(s.used_mb), format_mb(s.max_mb))),
            color: alert_color(mem_pct, self.settings.mem_alert_threshold, p.secondary, p),
            colors: self.gauge_colors(),
        })
        .width(Length::Fill)
        .height(Length::Fixed(170.0));

        let cpu_card = metric_card("CPU", cpu_gauge.into(), View::DetailCpu, busy, p);
        let mem_card = metric_card("Memory", mem_gauge.into(), View::DetailMemory, busy, p);
        let threads_card = metric_card("Threads", self.threads_summary(h), View::DetailThread, busy, p);

        let cards = row![cpu_card, mem_card, threads_card].spacing(8);

        let mut alerts: Vec<Element<Message>> = Vec::new();
        if cpu_pct >= self.settings.cpu_alert_threshold {
            alerts.push(
                text(format!(
                    "CPU usage at {:.0}% (threshold {:.0}%)",
                    cpu_pct, self.settings.cpu_alert_threshold
                ))
                .size(11)
                .color(p.alert)
                .into(),
            );
        }
        if mem_pct >= self.settings.mem_alert_threshold {
            alerts.push(
                text(format!(
                    "Memory usage at {:.0}% (threshold {:.0}%)",
                    mem_pct, self.settings.mem_alert_threshold
                ))
                .size(11)
                .color(p.alert)
                .into(),
            );
        }

        column![
            cards,
            Column::with_children(alerts).spacing(2),
            row![self.system_panel(h), self.trend_panel(h)].spacing(8),
        ]
        .spacing(8)
        .into()
    }

    fn threads_summary<'a>(&self, h: &'a MetricHistory) -> Element<'a, Message> {
        let p = &self.pal;
        let Some(t) = h.threads().latest() else {
            return text("no samples").size(11).color(p.label).into();
        };
        let live: Vec<f32> = h.threads().iter().map(|s| s.live as f32).collect();
        column![
            Space::with_height(18),
            container(text(t.live.to_string()).size(40).font(MONO).color(p.text)).center_x(Length::Fill),
            container(text("live threads").size(11).color(p.label)).center_x(Length::Fill),
            Space::with_height(12),
            Canvas::new(Sparkline { data: live, color: p.accent })
                .width(Length::Fill)
                .height(Length::Fixed(28.0)),
            row![
                text(format!("daemon {}", t.daemon)).size(11).font(MONO).color(p.label),
                Space::with_width(Length::Fill),
                text(format!("peak {}", t.peak)).size(11).font(MONO).color(p.label),
            ],
        ]
        .spacing(4)
        .height(Length::Fixed(170.0))
        .into()
    }

    fn system_panel<'a>(&self, h: &'a MetricHistory) -> Element<'a, Message> {
        let p = &self.pal;
        let body: Element<Message> = match h.system() {
            Some(sys) => column![
                info_row("OS", format!("{} {}", sys.os_name, sys.os_version), p),
                info_row("Architecture", &sys.architecture, p),
                info_row("Processors", sys.available_processors, p),
                info_row("JVM total", format_mb(sys.jvm_total_memory_mb), p),
                info_row("JVM free", format_mb(sys.jvm_free_memory_mb), p),
                info_row("JVM max", format_mb(sys.jvm_max_memory_mb), p),
            ]
            .spacing(4)
            .into(),
            None => text("not reported").size(11).color(p.label).into(),
        };
        panel(column![section_title("System", p), body].spacing(8).into(), p)
    }

    fn trend_panel<'a>(&self, h: &'a MetricHistory) -> Element<'a, Message> {
        let p = &self.pal;
        let cpu: Vec<f32> = h.cpu().iter().map(|s| s.system_pct as f32).collect();
        let mem: Vec<f32> = h.memory().iter().map(|s| s.percentage as f32).collect();
        let spark = |label: &'static str, data: Vec<f32>, color: Color| -> Element<'a, Message> {
            column![
                text(label).size(10).color(p.label),
                Canvas::new(Sparkline { data, color }).width(Length::Fill).height(Length::Fixed(26.0)),
            ]
            .spacing(2)
            .into()
        };
        panel(
            column![
                section_title("Trend", p),
                spark("CPU", cpu, p.accent),
                spark("Memory", mem, p.secondary),
                info_row("Samples", format!("{} / {}", h.len(MetricCategory::Cpu), h.capacity()), p),
            ]
            .spacing(8)
            .into(),
            p,
        )
    }

    // ─── DETAIL VIEWS ──────────────────────────────────────────

    fn view_detail_cpu(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let h = self.controller.history();
        let system = h.series(MetricCategory::Cpu);
        let process = h.cpu().to_series(|s| s.process_pct);

        let chart = make_chart(ChartCfg {
            title: "CPU usage".into(),
            series: vec![
                ChartSeries::from_points("system", p.accent, &system),
                ChartSeries::from_points("process", p.secondary, &process),
            ],
            labels: labels_of(&system),
            y_axis: YAxis::Fixed { min: 0.0, max: 100.0 },
            unit: "%".into(),
            height: 260.0,
            colors: self.chart_colors(),
        });

        let cores = h
            .cpu()
            .latest()
            .and_then(|s| s.cores)
            .map_or_else(|| "n/a".to_string(), |c| c.to_string());

        column![
            self.detail_header(MetricCategory::Cpu, h),
            chart,
            stats_panel("System CPU", h.stats(MetricCategory::Cpu), "%", p),
            stats_panel("Process CPU", WindowStats::over(h.cpu().iter().map(|s| s.process_pct)), "%", p),
            panel(info_row("Cores", cores, p), p),
        ]
        .spacing(8)
        .into()
    }

    fn view_detail_memory(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let h = self.controller.history();
        let pct = h.series(MetricCategory::Memory);
        let used = h.memory().to_series(|m| m.used_mb);
        let max = h.memory().to_series(|m| m.max_mb);

        let usage_chart = make_chart(ChartCfg {
            title: "Heap usage".into(),
            series: vec![ChartSeries::from_points("used", p.secondary, &pct)],
            labels: labels_of(&pct),
            y_axis: YAxis::Fixed { min: 0.0, max: 100.0 },
            unit: "%".into(),
            height: 220.0,
            colors: self.chart_colors(),
        });
        let mb_chart = make_chart(ChartCfg {
            title: "Heap size".into(),
            series: vec![
                ChartSeries::from_points("used", p.secondary, &used),
                ChartSeries::from_points("max", p.label, &max),
            ],
            labels: labels_of(&used),
            y_axis: YAxis::Auto,
            unit: " MB".into(),
            height: 200.0,
            colors: self.chart_colors(),
        });

        let details: Element<Message> = match h.memory().latest() {
            Some(m) => column![
                info_row("Used", format_mb(m.used_mb), p),
                info_row("Max", format_mb(m.max_mb), p),
                info_row("Free", format_mb(m.free_mb()), p),
                info_row("Committed", optional_mb(m.committed_mb), p),
                info_row("Heap used", optional_mb(m.heap_used_mb), p),
                info_row("Non-heap used", optional_mb(m.non_heap_used_mb), p),
            ]
            .spacing(4)
            .into(),
            None => text("no samples").size(11).color(p.label).into(),
        };

        column![
            self.detail_header(MetricCategory::Memory, h),
            usage_chart,
            stats_panel("Heap usage", h.stats(MetricCategory::Memory), "%", p),
            mb_chart,
            panel(column![section_title("Current", p), details].spacing(8).into(), p),
        ]
        .spacing(8)
        .into()
    }

    fn view_detail_threads(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let h = self.controller.history();
        let live = h.series(MetricCategory::Threads);
        let daemon = h.threads().to_series(|t| t.daemon as f64);
        let peak = h.threads().to_series(|t| t.peak as f64);

        let chart = make_chart(ChartCfg {
            title: "Threads".into(),
            series: vec![
                ChartSeries::from_points("live", p.accent, &live),
                ChartSeries::from_points("daemon", p.secondary, &daemon),
                ChartSeries::from_points("peak", p.label, &peak),
            ],
            labels: labels_of(&live),
            y_axis: YAxis::Auto,
            unit: String::new(),
            height: 260.0,
            colors: self.chart_colors(),
        });

        let derived: Element<Message> = match h.threads().latest() {
            Some(t) => column![
                info_row("User threads", t.user_threads(), p),
                info_row("Daemon share", format!("{:.1}%", t.daemon_pct()), p),
                info_row("Of peak", format!("{:.1}%", t.peak_utilization_pct()), p),
            ]
            .spacing(4)
            .into(),
            None => text("no samples").size(11).color(p.label).into(),
        };

        column![
            self.detail_header(MetricCategory::Threads, h),
            chart,
            stats_panel("Live threads", h.stats(MetricCategory::Threads), "", p),
            panel(column![section_title("Derived", p), derived].spacing(8).into(), p),
        ]
        .spacing(8)
        .into()
    }

    fn detail_header<'a>(&self, category: MetricCategory, h: &'a MetricHistory) -> Element<'a, Message> {
        let p = &self.pal;
        let busy = self.controller.is_busy();
        row![
            button(text("< overview").size(11).color(p.accent))
                .on_press_maybe((!busy).then_some(Message::SwitchView(View::Overview)))
                .style(button::text)
                .padding([2, 4]),
            Space::with_width(8),
            text(category.label()).size(14).color(p.text),
            Space::with_width(Length::Fill),
            text(format!("{} / {} samples", h.len(category), h.capacity())).size(10).font(MONO).color(p.label),
            button(text("refresh").size(11).color(p.accent))
                .on_press_maybe((!busy).then_some(Message::Refresh))
                .style(button::text)
                .padding([2, 6]),
        ]
        .spacing(4)
        .align_y(Alignment::Center)
        .into()
    }

    // ─── SETTINGS ──────────────────────────────────────────────

    fn view_settings(&self) -> Element<'_, Message> {
        let p = &self.pal;
        let s = &self.settings;

        let themes = Row::with_children(
            ThemeVariant::ALL
                .iter()
                .map(|&t| choice_button(t.to_string(), s.theme == t, Message::SetTheme(t), p)),
        )
        .spacing(4);
        let accents = Row::with_children(
            AccentColor::ALL
                .iter()
                .map(|&a| choice_button(a.to_string(), s.accent == a, Message::SetAccent(a), p)),
        )
        .spacing(4);
        let appearance = panel(
            column![
                section_title("Appearance", p),
                setting_row("Theme", "", themes.into(), p),
                setting_row("Accent", "", accents.into(), p),
            ]
            .spacing(8)
            .into(),
            p,
        );

        let alerts = panel(
            column![
                section_title("Alerts", p),
                setting_row(
                    "CPU threshold",
                    "Overview turns red above this",
                    make_threshold_buttons(s.cpu_alert_threshold, THRESHOLD_OPTIONS, Message::SetCpuAlertThreshold, p),
                    p,
                ),
                setting_row(
                    "Memory threshold",
                    "Overview turns red above this",
                    make_threshold_buttons(s.mem_alert_threshold, THRESHOLD_OPTIONS, Message::SetMemAlertThreshold, p),
                    p,
                ),
                setting_row(
                    "Notifications",
                    "Desktop alert on session expiry or lost feed",
                    choice_button(
                        if s.notifications { "on" } else { "off" },
                        s.notifications,
                        Message::ToggleNotifications,
                        p,
                    ),
                    p,
                ),
            ]
            .spacing(8)
            .into(),
            p,
        );

        let lifetimes = row![
            choice_button(
                "keep",
                s.buffer_lifetime == BufferLifetime::Persistent,
                Message::SetBufferLifetime(BufferLifetime::Persistent),
                p,
            ),
            choice_button(
                "per view",
                s.buffer_lifetime == BufferLifetime::PerView,
                Message::SetBufferLifetime(BufferLifetime::PerView),
                p,
            ),
        ]
        .spacing(4);
        let history = panel(
            column![
                section_title("History", p),
                setting_row(
                    "Across views",
                    "Changing this clears the current charts",
                    lifetimes.into(),
                    p,
                ),
                info_row("Dashboard window", format!("{} samples", s.dashboard_buffer_size), p),
                info_row("Detail window", format!("{} samples", s.detail_buffer_size), p),
            ]
            .spacing(8)
            .into(),
            p,
        );

        let heartbeat = if s.heartbeat_ms == 0 { "off".to_string() } else { format!("{} ms", s.heartbeat_ms) };
        let connection = panel(
            column![
                section_title("Connection", p),
                info_row("API", &s.api_base_url, p),
                info_row("Live feed", &s.ws_url, p),
                info_row("Topic", &s.metrics_topic, p),
                info_row("Reconnect", format!("{} x {} ms", s.reconnect_attempts, s.reconnect_delay_ms), p),
                info_row("Heartbeat", heartbeat, p),
                info_row("Settings file", self.settings_path.display(), p),
            ]
            .spacing(4)
            .into(),
            p,
        );

        column![appearance, alerts, history, connection].spacing(8).into()
    }
}

// ─── PUSH FEED ──────────────────────────────────────────────────

/// Connect, subscribe once the broker accepts us, and forward normalized
/// frames and lifecycle events until the channel gives up.
async fn run_feed(
    config: PushConfig,
    topic: String,
    store: SessionStore,
    normalizer: Arc<Normalizer>,
    mut output: mpsc::Sender<Message>,
) {
    let channel = PushChannel::new(config, store);
    let mut events = channel.events();
    if let Err(error) = channel.connect() {
        let _ = output.send(Message::Channel(ChannelEvent::Failed { error })).await;
        return park().await;
    }

    let mut feed: Option<TopicSubscription> = None;
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "channel events lagged");
                        // A Connected event may be among the missed ones
                        if ensure_feed(&channel, &mut feed, &topic)
                            && output.send(Message::Channel(ChannelEvent::Connected)).await.is_err()
                        {
                            break;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                // Subscriptions survive reconnects, so only the first connect subscribes
                if event == ChannelEvent::Connected {
                    ensure_feed(&channel, &mut feed, &topic);
                }
                let terminal = matches!(event, ChannelEvent::Failed { .. });
                if output.send(Message::Channel(event)).await.is_err() || terminal {
                    break;
                }
            }
            delivery = next_delivery(&mut feed) => match delivery {
                Some(delivery) => {
                    let Some(frame) = normalizer.parse_frame(&delivery.body) else { continue };
                    if output.send(Message::Frame(frame.into_value())).await.is_err() {
                        break;
                    }
                }
                None => feed = None,
            },
        }
    }

    channel.disconnect();
    park().await
}

/// Subscribe to the metrics topic if connected and not subscribed yet.
/// Returns true when a new subscription was made.
fn ensure_feed(channel: &PushChannel, feed: &mut Option<TopicSubscription>, topic: &str) -> bool {
    if feed.is_some() || !channel.is_connected() {
        return false;
    }
    match channel.subscribe(topic) {
        Ok(sub) => {
            *feed = Some(sub);
            true
        }
        Err(e) => {
            warn!(%topic, error = %e, "metrics subscription failed");
            false
        }
    }
}

async fn next_delivery(feed: &mut Option<TopicSubscription>) -> Option<Delivery> {
    match feed {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// Hold the subscription open without producing anything; iced would
/// otherwise consider the feed finished.
async fn park() {
    std::future::pending::<()>().await
}

// ─── HELPERS ────────────────────────────────────────────────────

/// Red at or above the threshold, amber within 15% of it.
fn alert_color(value: f64, threshold: f64, normal: Color, p: &Palette) -> Color {
    if value >= threshold {
        p.alert
    } else if value >= threshold * 0.85 {
        p.warn
    } else {
        normal
    }
}

fn format_mb(mb: f64) -> String {
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else {
        format!("{:.0} MB", mb)
    }
}

fn optional_mb(mb: Option<f64>) -> String {
    mb.map_or_else(|| "n/a".to_string(), format_mb)
}

fn labels_of(points: &[SeriesPoint]) -> Vec<String> {
    points.iter().map(|p| p.label.clone()).collect()
}

struct ChartCfg {
    title: String,
    series: Vec<ChartSeries>,
    labels: Vec<String>,
    y_axis: YAxis,
    unit: String,
    height: f32,
    colors: ChartColors,
}

fn make_chart(cfg: ChartCfg) -> Element<'static, Message> {
    let chart = TimeChart {
        title: cfg.title,
        series: cfg.series,
        labels: cfg.labels,
        y_axis: cfg.y_axis,
        unit: cfg.unit,
        colors: cfg.colors,
        show_avg: true,
    };
    Canvas::new(chart)
        .width(Length::Fill)
        .height(Length::Fixed(cfg.height))
        .into()
}

fn stats_panel<'a>(title: &str, stats: Option<WindowStats>, unit: &str, p: &Palette) -> Element<'a, Message> {
    let Some(s) = stats else {
        return panel(
            column![section_title(title, p), text("no samples").size(11).color(p.label)].spacing(6).into(),
            p,
        );
    };
    let cell = |label: &str, value: f64| -> Element<'a, Message> {
        column![
            text(label.to_string()).size(10).color(p.label),
            text(format!("{value:.1}{unit}")).size(14).font(MONO).color(p.text),
        ]
        .spacing(2)
        .width(Length::Fill)
        .into()
    };
    panel(
        column![
            section_title(title, p),
            row![cell("latest", s.latest), cell("avg", s.avg), cell("min", s.min), cell("max", s.max)].spacing(8),
        ]
        .spacing(6)
        .into(),
        p,
    )
}

fn metric_card<'a>(title: &str, body: Element<'a, Message>, target: View, busy: bool, p: &Palette) -> Element<'a, Message> {
    panel(
        column![
            row![
                section_title(title, p),
                Space::with_width(Length::Fill),
                button(text("details >").size(10).color(p.accent))
                    .on_press_maybe((!busy).then_some(Message::SwitchView(target)))
                    .style(button::text)
                    .padding([1, 4]),
            ]
            .align_y(Alignment::Center),
            body,
        ]
        .spacing(6)
        .into(),
        p,
    )
}

fn info_row<'a>(label: impl ToString, value: impl ToString, p: &Palette) -> Element<'a, Message> {
    row![
        text(format!("{}:", label.to_string())).size(11).color(p.label).width(120),
        text(value.to_string()).size(11).font(MONO).color(p.text),
    ]
    .spacing(8)
    .into()
}

fn setting_row<'a>(title: &str, desc: &str, control: Element<'a, Message>, p: &Palette) -> Element<'a, Message> {
    let mut label = column![text(title.to_string()).size(12).color(p.text)].spacing(2);
    if !desc.is_empty() {
        label = label.push(text(desc.to_string()).size(10).color(p.label));
    }
    row![label.width(Length::FillPortion(2)), control]
        .align_y(Alignment::Center)
        .spacing(12)
        .into()
}

fn choice_button<'a>(label: impl ToString, active: bool, on_press: Message, p: &Palette) -> Element<'a, Message> {
    let color = if active { p.accent } else { p.label };
    button(text(label.to_string()).size(11).font(MONO).color(color))
        .on_press(on_press)
        .style(if active { button::primary } else { button::secondary })
        .padding([4, 10])
        .into()
}

fn make_threshold_buttons<'a>(
    current: f64,
    options: &[f64],
    on_press: impl Fn(f64) -> Message,
    p: &Palette,
) -> Element<'a, Message> {
    let btns = options.iter().map(|&val| {
        let is_active = (current - val).abs() < 0.5;
        choice_button(format!("{:.0}%", val), is_active, on_press(val), p)
    });
    Row::with_children(btns).spacing(4).into()
}

fn panel<'a>(content: Element<'a, Message>, p: &Palette) -> Element<'a, Message> {
    let panel_bg = p.panel_bg;
    let border_c = p.border;
    container(content)
        .width(Length::Fill)
        .padding(10)
        .style(move |_: &Theme| container::Style {
            background: Some(Background::Color(panel_bg)),
            border: Border {
                color: border_c,
                width: 1.0,
                radius: 8.0.into(),
            },
            shadow: Shadow {
                color: Color::from_rgba(0.0, 0.0, 0.0, 0.15),
                offset: Vector::new(0.0, 2.0),
                blur_radius: 8.0,
            },
            ..Default::default()
        })
        .into()
}

fn panel_bg<'a>(content: Element<'a, Message>, bg: Color, border_c: Color) -> Element<'a, Message> {
    container(content)
        .width(Length::Fill)
        .style(move |_: &Theme| container::Style {
            background: Some(Background::Color(bg)),
            border: Border {
                color: border_c,
                width: 1.0,
                radius: 0.0.into(),
            },
            ..Default::default()
        })
        .into()
}

fn menu_tab<'a>(label: String, view: View, current: View, busy: bool, p: &Palette) -> Element<'a, Message> {
    let is_active = view == current;
    let accent = p.accent;
    let text_c = p.text;
    let color = if is_active { accent } else { p.label };
    let hover_color = Color::from_rgba(accent.r, accent.g, accent.b, 0.15);
    button(text(label).size(12).font(MONO).color(color))
        .on_press_maybe((!busy && !is_active).then_some(Message::SwitchView(view)))
        .padding([4, 14])
        .style(move |_: &Theme, status| {
            let bg = match status {
                button::Status::Hovered => hover_color,
                button::Status::Pressed => Color::from_rgba(accent.r, accent.g, accent.b, 0.25),
                _ if is_active => Color::from_rgba(accent.r, accent.g, accent.b, 0.1),
                _ => Color::TRANSPARENT,
            };
            button::Style {
                background: Some(Background::Color(bg)),
                text_color: text_c,
                border: Border {
                    color: Color::TRANSPARENT,
                    width: 0.0,
                    radius: 6.0.into(),
                },
                ..Default::default()
            }
        })
        .into()
}

fn section_title<'a>(label: &str, p: &Palette) -> Element<'a, Message> {
    text(label.to_string()).size(11).font(MONO).color(p.accent).into()
}
