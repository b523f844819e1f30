use anyhow::{Context, Result};
use log::{info, LevelFilter};
use presence_core::data_structures::VerificationMethod;
use presence_core::simulation::{ClassroomConfig, ClassroomReport, ClassroomSimulation};
use presence_core::SystemConfig;

// Usage: classroom-sim [classroom.json]
// Without a file the default classroom runs, with PRESENCE_* overrides applied.
#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    env_logger::Builder::from_default_env()
        .parse_filters(&log_filter(std::env::var("RUST_LOG").ok(), config.system.log_level))
        .init();

    info!(
        "Simulating {} students in {} ({} away, {} unenrolled)",
        config.students, config.class_id, config.absent_students, config.unenrolled_students
    );

    let report = ClassroomSimulation::build(config).run().await?;
    print_report(&report);

    println!("\nSummary JSON:");
    println!("{}", serde_json::to_string_pretty(&report.summary)?);
    Ok(())
}

// RUST_LOG, when set, takes precedence over the configured level.
fn log_filter(rust_log: Option<String>, level: LevelFilter) -> String {
    rust_log
        .filter(|filter| !filter.trim().is_empty())
        .unwrap_or_else(|| level.to_string())
}

fn load_config() -> Result<ClassroomConfig> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            let mut config: ClassroomConfig =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;
            // Environment wins over the file
            config
                .system
                .apply_env_overrides(|key| std::env::var(key).ok())
                .context("applying PRESENCE_* overrides")?;
            config
        }
        None => ClassroomConfig {
            system: SystemConfig::from_env().context("loading PRESENCE_* settings")?,
            ..ClassroomConfig::default()
        },
    };
    config.system.validate().context("invalid configuration")?;
    Ok(config)
}

fn print_report(report: &ClassroomReport) {
    println!("Session {} ({})", report.session.session_id, report.session.class_id);

    let enrolled = report
        .enrollments
        .iter()
        .filter(|e| e.fingerprint.is_some())
        .count();
    println!("  Enrollment attempts: {} ({} succeeded)", report.enrollments.len(), enrolled);

    println!("  Records:");
    for record in &report.records {
        println!(
            "    {:<6} {:<8} {:<10} {}s",
            record.student_id,
            format!("{:?}", record.status).to_lowercase(),
            record.verified_by.label(),
            record.duration_seconds
        );
    }

    let summary = &report.summary;
    println!(
        "  Present: {}  Late: {}  Absent: {}  Attendance: {:.1}%",
        summary.present,
        summary.late,
        summary.absent,
        summary.attendance_rate() * 100.0
    );
    for method in [VerificationMethod::Face, VerificationMethod::Ble, VerificationMethod::Manual] {
        if let Some(count) = summary.by_method.get(&method) {
            println!("    via {}: {}", method.label(), count);
        }
    }
    println!("  Audit events: {}", report.audit.len());
}
