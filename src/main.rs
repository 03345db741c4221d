use std::path::PathBuf;

use log::info;

use replikv::{Config, Simulator};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments (simple)
    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();

    // Simple argument parsing
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--inputdir" | "-d" => {
                if i + 1 < args.len() {
                    config.input_dir = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--input" | "-i" => {
                if i + 1 < args.len() {
                    config.input = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("RepliKV - A minimal replicated key-value transaction simulator");
                println!();
                println!("Usage: replikv [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --inputdir DIR    Script directory (default: ./input/)");
                println!("  -i, --input FILE      Script filename (default: input1)");
                println!("  -h, --help            Show this help");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!("Starting RepliKV simulator...");

    let mut simulator = Simulator::new();
    let output = simulator.run_file(&config.script_path())?;
    for line in output {
        println!("{}", line);
    }

    Ok(())
}
