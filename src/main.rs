//! jnishim - inspect and resolve native-interface foreign modules
//!
//! # Usage
//!
//! ```bash
//! # List the classes in the builtin table
//! jnishim classes --verbose
//!
//! # Show what a module imports and which natives it must provide
//! jnishim inspect target/debug/libjnishim_demo.so
//!
//! # Load a module and resolve it against the builtin table
//! jnishim resolve target/debug/libjnishim_demo.so
//!
//! # Resolve the demo module and call each of its natives
//! jnishim demo target/debug/libjnishim_demo.so
//!
//! # Print the exported symbol names for a native method
//! jnishim mangle java/lang/String length "()I"
//!
//! # Trace resolution
//! jnishim --log-level debug resolve target/debug/libjnishim_demo.so
//! ```

mod greeter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use jnishim_runtime::descriptor::{jni_long_name, jni_short_name};
use jnishim_runtime::resolve::{resolve_global, ForeignModule};
use jnishim_runtime::{logging, registry, JniEnv, LibraryModule};

#[derive(Parser)]
#[command(name = "jnishim")]
#[command(version = "0.1.0")]
#[command(about = "Inspect and resolve native-interface foreign modules", long_about = None)]
struct Cli {
    /// Log level (off, error, warn, info, debug, trace); overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<log::LevelFilter>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered classes
    Classes {
        /// Also list methods and fields
        #[arg(short, long)]
        verbose: bool,

        /// Only classes whose name contains this text
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show a module's import table and the natives it is expected to export
    Inspect {
        /// Path to the shared library
        module: PathBuf,
    },

    /// Load a module and bind it against the class table
    Resolve {
        /// Path to the shared library
        module: PathBuf,
    },

    /// Resolve the jnishim-demo module and call its natives
    Demo {
        /// Path to the demo shared library
        module: PathBuf,
    },

    /// Print the short and long symbol names of a native method
    Mangle {
        /// Fully qualified class name, e.g. java/lang/String
        class: String,
        method: String,
        /// Method signature, e.g. "(I)V"
        signature: String,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.log_level {
        Some(level) => logging::init_with_level(level),
        None => logging::init_from_env(),
    }

    let result = match cli.command {
        Commands::Classes { verbose, filter } => list_classes(verbose, filter),
        Commands::Inspect { module } => inspect_module(module),
        Commands::Resolve { module } => resolve_module(module),
        Commands::Demo { module } => run_demo(module),
        Commands::Mangle {
            class,
            method,
            signature,
        } => {
            println!("{}", jni_short_name(&class, &method));
            println!("{}", jni_long_name(&class, &method, &signature));
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn list_classes(verbose: bool, filter: Option<String>) -> Result<(), String> {
    let table = registry::global().map_err(|e| e.to_string())?;

    for class in table.enumerate() {
        let name = class.full_name();
        if let Some(filter) = &filter {
            if !name.contains(filter.as_str()) {
                continue;
            }
        }
        println!("{} ({} bytes)", name, class.instance_size);

        if verbose {
            for method in class.managed_methods.iter() {
                println!(
                    "    {:<10} {}{} [{} args]",
                    method.shape,
                    method.name,
                    method.signature,
                    method.arg_count()
                );
            }
            for native in class.native_methods.iter() {
                let state = if native.is_bound() { "bound" } else { "unbound" };
                println!(
                    "    {:<10} {}{} from {} ({})",
                    "native", native.name, native.signature, native.soname, state
                );
            }
            for field in class.fields.iter() {
                let kind = if field.is_static() { "static" } else { "field" };
                println!("    {:<10} {} {} @ {:#x}", kind, field.name, field.signature, field.address);
            }
        }
    }

    Ok(())
}

fn inspect_module(path: PathBuf) -> Result<(), String> {
    log::debug!("inspecting {}", path.display());
    let module = LibraryModule::open(&path).map_err(|e| e.to_string())?;
    let table = registry::global().map_err(|e| e.to_string())?;

    println!("Module: {}", module.name());

    let imports = module.imports();
    println!("Imports ({}):", imports.len());
    for request in imports.iter() {
        let key = request.key();
        let found = table.find_method(&key).is_some();
        let shape = request
            .shape
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!(
            "    [{}] {:<10} {}",
            if found { "ok" } else { "missing" },
            shape,
            key
        );
    }

    println!("Natives:");
    for class in table.enumerate() {
        for native in class.native_methods.iter().filter(|m| m.soname == module.name()) {
            let candidates = native.symbol_candidates(class);
            let exported = candidates.iter().find(|s| module.symbol(s).is_some());
            match exported {
                Some(symbol) => println!("    [ok] {}", symbol),
                None => println!("    [missing] {}", candidates[0]),
            }
        }
    }

    Ok(())
}

fn resolve_module(path: PathBuf) -> Result<(), String> {
    let mut module = LibraryModule::open(&path).map_err(|e| e.to_string())?;
    let report = resolve_global(&mut module).map_err(|e| e.to_string())?;

    println!(
        "Resolved {}: {} native(s), {} import(s)",
        report.module, report.natives_bound, report.imports_bound
    );

    Ok(())
}

fn run_demo(path: PathBuf) -> Result<(), String> {
    let mut module = LibraryModule::open(&path).map_err(|e| e.to_string())?;
    if module.name() != greeter::DEMO_MODULE {
        return Err(format!(
            "expected a module named {}, got {}",
            greeter::DEMO_MODULE,
            module.name()
        ));
    }
    resolve_global(&mut module).map_err(|e| e.to_string())?;

    let env = JniEnv::global().map_err(|e| e.to_string())?;
    for (call, result) in greeter::exercise(env)? {
        println!("{} = {}", call, result);
    }

    Ok(())
}
