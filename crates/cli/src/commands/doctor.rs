use datapilot_core::config::{AppConfig, LoadOptions};
use datapilot_core::ToolProvider;
use datapilot_db::{connect_with_config, ping};
use datapilot_mcp::{McpToolProvider, SessionState};
use serde::Serialize;

use crate::commands::async_runtime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_llm_readiness(&config));
            checks.extend(check_connectivity(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(DoctorCheck::skipped("llm_readiness"));
            checks.push(DoctorCheck::skipped("database_connectivity"));
            checks.push(DoctorCheck::skipped("tool_backends"));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// The endpoint itself is not called; a live request would spend tokens.
fn check_llm_readiness(config: &AppConfig) -> DoctorCheck {
    let details = format!(
        "{} model `{}` at {}",
        config.llm.provider.as_str(),
        config.llm.model,
        config.llm.resolved_base_url()
    );
    if config.llm.provider.requires_api_key() && config.llm.api_key.is_none() {
        return DoctorCheck {
            name: "llm_readiness",
            status: CheckStatus::Fail,
            details: format!("{details}: api key missing"),
        };
    }
    DoctorCheck { name: "llm_readiness", status: CheckStatus::Pass, details }
}

fn check_connectivity(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match async_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            let details = format!("failed to initialize async runtime: {error}");
            return vec![
                DoctorCheck {
                    name: "database_connectivity",
                    status: CheckStatus::Fail,
                    details: details.clone(),
                },
                DoctorCheck { name: "tool_backends", status: CheckStatus::Fail, details },
            ];
        }
    };

    runtime.block_on(async {
        vec![check_database(config).await, check_backends(config).await]
    })
}

async fn check_database(config: &AppConfig) -> DoctorCheck {
    let result = async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let pinged = ping(&pool).await.map_err(|error| format!("database query failed: {error}"));
        pool.close().await;
        pinged
    }
    .await;

    match result {
        Ok(()) => DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        },
        Err(error) => {
            DoctorCheck { name: "database_connectivity", status: CheckStatus::Fail, details: error }
        }
    }
}

async fn check_backends(config: &AppConfig) -> DoctorCheck {
    if config.mcp.servers.is_empty() {
        return DoctorCheck {
            name: "tool_backends",
            status: CheckStatus::Pass,
            details: "no tool backends configured".to_string(),
        };
    }

    let provider = match McpToolProvider::from_config(&config.mcp) {
        Ok(provider) => provider,
        Err(error) => {
            return DoctorCheck {
                name: "tool_backends",
                status: CheckStatus::Fail,
                details: error.to_string(),
            };
        }
    };

    let discovered = provider.tools().await.map(|tools| tools.len());
    let statuses = provider.backend_status().await;
    provider.close().await;

    let unreachable: Vec<&str> = statuses
        .iter()
        .filter(|status| status.state != SessionState::Connected)
        .map(|status| status.name.as_str())
        .collect();

    match discovered {
        Ok(tool_count) if unreachable.is_empty() => DoctorCheck {
            name: "tool_backends",
            status: CheckStatus::Pass,
            details: format!("{} backend(s) reachable, {tool_count} tool(s) discovered", statuses.len()),
        },
        Ok(_) => DoctorCheck {
            name: "tool_backends",
            status: CheckStatus::Fail,
            details: format!("unreachable backends: {}", unreachable.join(", ")),
        },
        Err(error) => {
            DoctorCheck { name: "tool_backends", status: CheckStatus::Fail, details: error.to_string() }
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
