//! Terminal presentation: colored status lines, the spinner and the interactive menu.

use crate::engine::error::{classify, KilnError};
use crate::engine::maintenance::{Health, HealthReport, Verdict};
use crate::engine::statistics::{RunStatistics, StepOutcome};
use crate::engine::Engine;
use owo_colors::{OwoColorize, Stream};
use std::time::{Duration, SystemTime};

pub mod menu;
pub mod spinner;

pub mod symbols {
    pub const SUCCESS: &str = "✓";
    pub const ERROR: &str = "✗";
    pub const WARNING: &str = "⚠";
    pub const INFO: &str = "•";
    pub const ARROW: &str = "→";
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}.{:02}s", secs, millis / 10)
    } else {
        format!("{}ms", millis)
    }
}

pub fn print_header(title: &str, subtitle: &str) {
    let rule = "═".repeat(60);
    println!();
    println!("{}", rule.if_supports_color(Stream::Stdout, |s| s.magenta()));
    println!("  {}", title.if_supports_color(Stream::Stdout, |s| s.bold()));
    if !subtitle.is_empty() {
        println!("  {}", subtitle.if_supports_color(Stream::Stdout, |s| s.dimmed()));
    }
    println!("{}", rule.if_supports_color(Stream::Stdout, |s| s.magenta()));
}

pub fn print_success(message: &str) {
    println!(
        "{} {}",
        symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
        message
    );
}

pub fn print_error(message: &str) {
    eprintln!(
        "{} {}",
        symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
        message.if_supports_color(Stream::Stderr, |s| s.red())
    );
}

pub fn print_warning(message: &str) {
    eprintln!(
        "{} {}",
        symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
        message.if_supports_color(Stream::Stderr, |s| s.yellow())
    );
}

pub fn print_info(message: &str) {
    println!(
        "{} {}",
        symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
        message
    );
}

pub fn print_stat(label: &str, value: &str) {
    println!(
        "  {:<16} {}",
        label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
        value
    );
}

/// Prints a failed action with a hint matching its kind.
pub fn report_error(err: &anyhow::Error) {
    print_error(&format!("{:#}", err));

    let kind = classify(err);
    let hint = match kind {
        Some(KilnError::Network { .. }) => "Check the internet connection and try again",
        Some(KilnError::Integrity { .. }) => "The download was discarded, try again to fetch it anew",
        Some(KilnError::MissingDependency { .. }) => "Run the earlier setup steps first",
        Some(KilnError::ProjectStructure { .. }) => "Clone the repository first",
        Some(KilnError::Installation { .. }) => "Try reinstalling from the maintenance menu",
        Some(KilnError::Build { .. }) => "Inspect the build output above and the log file",
        Some(KilnError::Packaging { .. }) => "Make sure Node.js is installed and the build succeeded",
        None => return,
    };

    let retry = if kind.map(KilnError::is_recoverable).unwrap_or(false) {
        " (temporary, retrying is safe)"
    } else {
        ""
    };

    println!(
        "  {} {}{}",
        symbols::ARROW.if_supports_color(Stream::Stdout, |s| s.cyan()),
        hint,
        retry
    );
}

pub fn show_health(report: &HealthReport) {
    print_header("HEALTH CHECK", "Status of every component");

    for (component, health) in &report.components {
        let symbol = match health {
            Health::Healthy(_) => symbols::SUCCESS
                .if_supports_color(Stream::Stdout, |s| s.green())
                .to_string(),
            Health::Missing(_) => symbols::WARNING
                .if_supports_color(Stream::Stdout, |s| s.yellow())
                .to_string(),
            Health::Error(_) => symbols::ERROR
                .if_supports_color(Stream::Stdout, |s| s.red())
                .to_string(),
        };

        println!(
            "{} {:<14} {}",
            symbol,
            component.name().to_uppercase(),
            health.detail()
        );
    }

    let counts = format!("{}/{} components OK", report.healthy_count(), report.components.len());
    match report.verdict() {
        Verdict::Healthy => print_success(&format!("Everything is healthy ({})", counts)),
        Verdict::Partial => print_warning(&format!("Partially working ({})", counts)),
        Verdict::Degraded => print_error(&format!("Serious problems ({})", counts)),
    }

    let recommendations = report.recommendations();
    if !recommendations.is_empty() {
        println!();
        print_info("Recommendations:");
        for r in recommendations {
            println!("  {} {}", symbols::ARROW, r);
        }
    }
}

fn or_na(value: Option<String>) -> String {
    value.unwrap_or_else(|| "n/a".to_string())
}

pub fn show_info(engine: &Engine, stats: &RunStatistics) {
    let settings = &engine.settings;
    print_header("SYSTEM INFORMATION", &settings.project().name);

    print_stat("Working dir", &settings.workdir().display().to_string());
    print_stat("Project dir", &settings.repo_path().display().to_string());
    print_stat("Local root", &settings.local_root().display().to_string());
    print_stat("Log file", &settings.log_path().display().to_string());
    print_stat("Cloned", if stats.cloned { "yes" } else { "no" });
    print_stat("Node.js", &or_na(stats.node_version.clone()));
    print_stat("pnpm", &or_na(stats.pnpm_version.clone()));
    print_stat(
        "Last build",
        &or_na(stats.last_build.map(|at| {
            let ago = SystemTime::now().duration_since(at).unwrap_or_default();
            format!("{} ago", format_duration(ago))
        })),
    );
    print_stat("Build time", &or_na(stats.build_duration.map(format_duration)));
    print_stat(
        "Package size",
        &or_na(stats.package_size_mb.map(|mb| format!("{:.2} MB", mb))),
    );
}

pub fn show_summary(stats: &RunStatistics) {
    print_header("SUMMARY", &format!("Total {}", format_duration(stats.total_duration())));

    for (step, outcome) in &stats.steps {
        match outcome {
            StepOutcome::Succeeded(d) => {
                print_success(&format!("{:<8} {}", step.name(), format_duration(*d)))
            }
            StepOutcome::Failed(e) => print_error(&format!("{:<8} {}", step.name(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_are_human_readable() {
        assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
    }

    #[test]
    fn missing_values_render_as_na() {
        assert_eq!(or_na(None), "n/a");
        assert_eq!(or_na(Some("v20.18.0".to_string())), "v20.18.0");
    }
}
