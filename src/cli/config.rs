use crate::config::generate::generate_starter_config;
use crate::config::user_config_path;
use std::fs;
use std::path::PathBuf;

const SYSTEM_CONFIG: &str = "/etc/loqi/config.yml";

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    write_config(&generate_starter_config(), stdout)
}

fn write_config(config_content: &str, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Prefer ~/.config/loqi/config.yml, fall back to /etc/loqi/config.yml
    let config_path = user_config_path()
        .filter(|path| match path.parent() {
            Some(parent) => match fs::create_dir_all(parent) {
                Ok(()) => true,
                Err(_) => {
                    eprintln!("Warning: Could not create directory {}", parent.display());
                    eprintln!("Falling back to {}", SYSTEM_CONFIG);
                    false
                }
            },
            None => false,
        })
        .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG));

    if config_path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match crate::config::load_config(&path) {
        Ok(_) => {
            println!("Config is valid");
            Ok(())
        }
        Err(e) => {
            eprintln!("Config validation failed:\n{}", e);
            Err(e.into())
        }
    }
}
