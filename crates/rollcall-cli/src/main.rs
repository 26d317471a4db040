use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session
    Start,
    /// Stop the active session
    Stop,
    /// Register a new student (captures face samples from the camera)
    Register {
        /// Student name (must be unique)
        name: String,
    },
    /// Show daemon status
    Status,
    /// Show attendance statistics
    Stats,
    /// List attendance records
    Attendance {
        /// Only records for this date (DD-MM-YYYY); all records if omitted
        #[arg(short, long)]
        date: Option<String>,
    },
    /// List registered students
    Students,
    /// Export all attendance records to a timestamped CSV
    Export,
    /// Delete all attendance data and registered students
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// Check database/CSV consistency
    Verify,
    /// Run camera diagnostics (no daemon needed)
    Test,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start_attendance(&self) -> zbus::Result<()>;
    fn register(&self, name: &str) -> zbus::Result<()>;
    fn stop_session(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn stats(&self) -> zbus::Result<String>;
    fn attendance(&self, date: &str) -> zbus::Result<String>;
    fn list_students(&self) -> zbus::Result<String>;
    fn export(&self) -> zbus::Result<String>;
    fn clear(&self) -> zbus::Result<()>;
    fn verify(&self) -> zbus::Result<String>;
}

async fn proxy() -> Result<AttendanceProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to session bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("is rollcalld running?")
}

/// Re-serialize a JSON reply with indentation; raw fallback if it ever isn't JSON.
fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            proxy().await?.start_attendance().await?;
            println!("Attendance session started");
        }
        Commands::Stop => {
            if proxy().await?.stop_session().await? {
                println!("Session stopped");
            } else {
                println!("No session was running");
            }
        }
        Commands::Register { name } => {
            proxy().await?.register(&name).await?;
            println!("Registering {name}; look at the camera until capture completes");
        }
        Commands::Status => {
            println!("{}", pretty(&proxy().await?.status().await?));
        }
        Commands::Stats => {
            println!("{}", pretty(&proxy().await?.stats().await?));
        }
        Commands::Attendance { date } => {
            let date = date.unwrap_or_default();
            println!("{}", pretty(&proxy().await?.attendance(&date).await?));
        }
        Commands::Students => {
            println!("{}", pretty(&proxy().await?.list_students().await?));
        }
        Commands::Export => {
            let path = proxy().await?.export().await?;
            println!("Exported to {path}");
        }
        Commands::Clear { force } => {
            if !force && !confirm("Delete ALL attendance data and students?")? {
                println!("Aborted");
                return Ok(());
            }
            proxy().await?.clear().await?;
            println!("All data cleared");
        }
        Commands::Verify => {
            println!("{}", proxy().await?.verify().await?);
        }
        Commands::Test => run_camera_test()?,
    }

    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

/// Open each capture device directly and grab a frame, bypassing the daemon.
fn run_camera_test() -> Result<()> {
    let devices = rollcall_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return Ok(());
    }

    for info in devices {
        println!("{}: {} ({})", info.path, info.name, info.driver);
        match rollcall_hw::Camera::open(&info.path) {
            Ok(camera) => {
                println!("  opened at {}x{}", camera.width, camera.height);
                match camera.stream().and_then(|mut s| {
                    s.discard(4);
                    s.next_frame()
                }) {
                    Ok(frame) => {
                        println!(
                            "  captured frame {}: avg brightness {:.1}{}",
                            frame.sequence,
                            frame.avg_brightness(),
                            if frame.is_dark() { " (dark)" } else { "" }
                        );
                    }
                    Err(e) => println!("  capture failed: {e}"),
                }
            }
            Err(e) => println!("  open failed: {e}"),
        }
    }
    Ok(())
}
