//! `buslink start` and `buslink check-config`.

use crate::ui;
use buslink_kernel::{Collaborators, Gateway, GatewayError, GatewayResult, LocalBus, StartReport};
use buslink_types::config::GatewayConfig;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

pub fn cmd_start(config: GatewayConfig) -> ExitCode {
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            ui::error_with_fix(&format!("Failed to create runtime: {e}"), "Check system limits");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run_gateway(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway failed");
            ui::error_with_fix(&format!("{e}"), "Run `buslink check-config` for details");
            ExitCode::FAILURE
        }
    }
}

async fn run_gateway(config: GatewayConfig) -> GatewayResult<()> {
    let bus = LocalBus::from_config(&config.local_services);
    let gateway = Arc::new(Gateway::build(&config, Collaborators::local(&bus))?);

    let report = gateway.start().await;
    print_start_report(&gateway, &report);
    if !report.is_clean() && report.listeners_up + report.outbound_registered == 0 {
        gateway.shutdown().await;
        return Err(GatewayError::StartFailed(
            "no listener or outbound domain came up".to_string(),
        ));
    }

    let signal = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl+C received"),
                Err(e) => warn!(error = %e, "Cannot listen for Ctrl+C; stopping"),
            }
            gateway.request_shutdown();
        })
    };

    gateway.wait_for_shutdown().await;
    signal.abort();
    gateway.shutdown().await;
    Ok(())
}

fn print_start_report(gateway: &Gateway, report: &StartReport) {
    ui::banner();
    ui::blank();
    let status = gateway.status();
    for listener in &status.listeners {
        let state = match gateway.listener(&listener.name).and_then(|l| l.local_addr()) {
            Some(addr) => format!("listening on {addr}"),
            None => "down".to_string(),
        };
        ui::kv(&format!("Listener {}", listener.name), &state);
    }
    for domain in &status.inbound {
        ui::kv(&format!("Inbound {}", domain.name), "open");
    }
    for domain in &status.outbound {
        ui::kv(&format!("Outbound {}", domain.name), &domain.remote);
    }
    for failure in &report.failures {
        ui::check_warn(&format!("{}: {}", failure.component, failure.error));
    }
    ui::blank();
    ui::hint("Press Ctrl+C to stop the gateway");
    ui::blank();
}

pub fn cmd_check_config(path: &Path, config: &GatewayConfig, json: bool) -> ExitCode {
    if json {
        match serde_json::to_string_pretty(config) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                ui::error_with_fix(&format!("Cannot render config: {e}"), "Report this as a bug");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    ui::section(&format!("Config {}", path.display()));
    ui::check_ok(&format!("{} listener(s)", config.listeners.len()));
    ui::check_ok(&format!("{} inbound domain(s)", config.inbound.len()));
    ui::check_ok(&format!("{} outbound domain(s)", config.outbound.len()));
    ui::check_ok(&format!("{} local service(s)", config.local_services.len()));
    for domain in &config.inbound {
        if domain.offers.is_empty() {
            ui::check_warn(&format!("Inbound domain '{}' offers nothing", domain.name));
        }
    }
    for domain in &config.outbound {
        if !domain.accept_all && domain.mappings.is_empty() {
            ui::check_warn(&format!(
                "Outbound domain '{}' accepts no propagated service",
                domain.name
            ));
        }
    }
    ExitCode::SUCCESS
}
