#![windows_subsystem = "windows"]

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vigil::ui::Vigil;
use vigil::{SessionStore, Settings};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigil=info")))
        .init();

    let settings_path = Settings::default_path();
    let settings = Settings::load();
    info!(api = %settings.api_base_url, feed = %settings.ws_url, "starting");

    let store = match SessionStore::open() {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "session store unavailable, sign-in will not persist");
            SessionStore::in_memory()?
        }
    };
    let (app, boot) = Vigil::boot(settings, settings_path, store)?;

    iced::application(Vigil::title, Vigil::update, Vigil::view)
        .subscription(Vigil::subscription)
        .theme(Vigil::theme)
        .window(iced::window::Settings {
            size: (1040.0, 720.0).into(),
            #[cfg(target_os = "linux")]
            platform_specific: iced::window::settings::PlatformSpecific {
                application_id: String::from("vigil"),
                ..Default::default()
            },
            ..Default::default()
        })
        .run_with(move || (app, boot))?;
    Ok(())
}
