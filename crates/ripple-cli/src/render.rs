use std::collections::HashMap;

use anyhow::Result;
use colored::{Color, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ripple_core::events::{Event, TaskStatus};

/// Colors assigned to projects for distinguishing concurrent output.
const PROJECT_COLORS: &[Color] = &[
    Color::Cyan,
    Color::Green,
    Color::Yellow,
    Color::Blue,
    Color::Magenta,
    Color::Red,
    Color::BrightCyan,
    Color::BrightGreen,
    Color::BrightYellow,
    Color::BrightBlue,
];

/// Create a styled progress bar for project builds.
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_message(message.to_string());
    pb
}

/// Spawn a renderer task with a progress bar.
///
/// Returns an event sender and a join handle. Drop the sender when done to
/// signal the render loop to finish, then await the handle.
pub fn spawn_renderer(
    total: usize,
    message: &str,
) -> (mpsc::UnboundedSender<Event>, JoinHandle<Result<()>>) {
    let pb = create_progress_bar(total as u64, message);
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move { render_loop(rx, Some(pb)).await });
    (tx, handle)
}

/// Spawn a renderer task without a progress bar.
///
/// This is the line-oriented degradation of the UI sink: every event
/// becomes a stdout/stderr line. Used by watch mode and by commands that
/// want colored output but no progress indicator.
pub fn spawn_plain_renderer() -> (mpsc::UnboundedSender<Event>, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move { render_loop(rx, None).await });
    (tx, handle)
}

/// Get the color for a project name, assigning a new one if not seen before.
fn project_color(color_map: &mut HashMap<String, Color>, color_idx: &mut usize, name: &str) -> Color {
    *color_map.entry(name.to_string()).or_insert_with(|| {
        let c = PROJECT_COLORS[*color_idx % PROJECT_COLORS.len()];
        *color_idx += 1;
        c
    })
}

/// Internal render loop that processes events and produces terminal output.
async fn render_loop(mut rx: mpsc::UnboundedReceiver<Event>, pb: Option<ProgressBar>) -> Result<()> {
    let mut color_map: HashMap<String, Color> = HashMap::new();
    let mut color_idx = 0usize;
    // Task names by id, for status/port lines after TaskAdded
    let mut task_names: HashMap<u64, String> = HashMap::new();

    while let Some(event) = rx.recv().await {
        match event {
            Event::WaveStarted {
                wave,
                total_waves,
                ref projects,
            } => {
                println!(
                    "\n{} Wave {}/{}: {}",
                    "~".cyan().bold(),
                    wave,
                    total_waves,
                    projects.join(", ").bold()
                );
            }
            Event::ProjectStarted {
                ref name,
                step,
                total_steps,
                ..
            } => {
                let color = project_color(&mut color_map, &mut color_idx, name);
                let prefix = format!("[{}]", name).color(color).bold();
                println!(
                    "{} {} {}",
                    prefix,
                    "building".dimmed(),
                    format!("({}/{})", step, total_steps).dimmed()
                );
            }
            Event::ProjectOutput {
                ref name,
                ref line,
                is_stderr,
            } => {
                let color = project_color(&mut color_map, &mut color_idx, name);
                let prefix = format!("[{}]", name).color(color).bold();
                if is_stderr {
                    eprintln!("{} {}", prefix, line);
                } else {
                    println!("{} {}", prefix, line);
                }
            }
            Event::ProjectFinished {
                ref name,
                success,
                duration,
            } => {
                let color = project_color(&mut color_map, &mut color_idx, name);
                let prefix = format!("[{}]", name).color(color).bold();
                let elapsed = format!("({:.1}s)", duration.as_secs_f64());
                if success {
                    println!("{} {} {}", prefix, "SUCCESS".green(), elapsed.dimmed());
                } else {
                    eprintln!("{} {} {}", prefix, "FAILED".red(), elapsed.dimmed());
                }
                if let Some(ref pb) = pb {
                    pb.inc(1);
                }
            }
            Event::GeneratorStarted { ref key } => {
                println!("\n{} Running generator '{}'...", "$".cyan(), key.bold());
            }
            Event::GeneratorOutput {
                ref key,
                ref line,
                is_stderr,
            } => {
                let prefix = format!("[{}]", key).magenta();
                if is_stderr {
                    eprintln!("{} {}", prefix, line);
                } else {
                    println!("{} {}", prefix, line);
                }
            }
            Event::GeneratorFinished {
                ref key,
                success,
                duration,
            } => {
                let elapsed = format!("({:.1}s)", duration.as_secs_f64());
                if success {
                    println!("{} generator '{}' {}", "SUCCESS".green(), key, elapsed.dimmed());
                } else {
                    eprintln!("{} generator '{}' {}", "FAILED".red(), key, elapsed.dimmed());
                }
            }
            Event::TaskAdded { id, ref name, pid } => {
                task_names.insert(id, name.clone());
                println!(
                    "{} Started dev task {} {}",
                    ">".green().bold(),
                    name.bold(),
                    format!("(pid {})", pid).dimmed()
                );
            }
            Event::TaskStatus { id, status } => {
                let name = task_names.get(&id).map(|s| s.as_str()).unwrap_or("?");
                let label = match status {
                    TaskStatus::Running => "running".green(),
                    TaskStatus::Stopped => "stopped".yellow(),
                    TaskStatus::Error => "error".red(),
                };
                println!("{} Task {} is {}", "i".blue(), name.bold(), label);
            }
            Event::TaskPort { id, port } => {
                let name = task_names.get(&id).map(|s| s.as_str()).unwrap_or("?");
                println!(
                    "{} Task {} listening on port {}",
                    "i".blue(),
                    name.bold(),
                    port.to_string().cyan()
                );
            }
            Event::TaskRemoved { id } => {
                task_names.remove(&id);
            }
            Event::TaskLog {
                ref name,
                ref line,
                is_stderr,
            } => {
                let color = project_color(&mut color_map, &mut color_idx, name);
                let prefix = format!("[{}]", name).color(color);
                if is_stderr {
                    eprintln!("{} {}", prefix, line);
                } else {
                    println!("{} {}", prefix, line);
                }
            }
            Event::Status(Some(ref status)) => {
                if let Some(ref pb) = pb {
                    pb.set_message(status.clone());
                } else {
                    println!("{} {}", "*".cyan(), status.dimmed());
                }
            }
            Event::Status(None) => {
                if let Some(ref pb) = pb {
                    pb.set_message("");
                }
            }
            Event::Warning(ref msg) => {
                eprintln!("{} {}", "WARNING:".yellow().bold(), msg);
            }
            Event::Info(ref msg) => {
                println!("{}", msg);
            }
        }
    }

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    Ok(())
}
