use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use pynux::arch::Arch;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = Command::new("pynux")
        .about("Pynux compiler: Python syntax to ARM Thumb-2 assembly")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .subcommand(
            Command::new("compile")
                .about("Compile one source file to assembly")
                .arg(
                    Arg::new("input")
                        .value_name("INPUT.py")
                        .required(true)
                        .help("Source file"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("OUT.s")
                        .help("Output file ('-' for stdout)"),
                )
                .arg(
                    Arg::new("target")
                        .short('t')
                        .long("target")
                        .value_name("CPU")
                        .default_value("cortex-m3")
                        .value_parser(Arch::names())
                        .action(ArgAction::Set)
                        .help("Target processor"),
                ),
        )
        .get_matches();

    let Some(("compile", compile)) = args.subcommand() else {
        bail!("unknown subcommand");
    };

    let input = PathBuf::from(compile.get_one::<String>("input").unwrap());
    let target = compile.get_one::<String>("target").unwrap();
    let arch = Arch::from_str(target).expect("clap allowed a bad target");

    let source = fs::read_to_string(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;

    let filename = input.display().to_string();
    let assembly = pynux::compile(&source, &filename, arch)?;

    let output = compile
        .get_one::<String>("output")
        .cloned()
        .unwrap_or_else(|| input.with_extension("s").display().to_string());

    if output == "-" {
        print!("{}", assembly);
    } else {
        fs::write(&output, assembly)
            .with_context(|| format!("failed to write {}", output))?;
    }

    Ok(())
}
