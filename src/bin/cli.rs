//! Reference CLI: compiles and runs one of `harness`'s fixture scenarios
//! against the in-process `ScriptHost`, since this repository has no host
//! compiler to turn source text into code objects of its own.
//!
//! Run with `--help` for the list of scenarios.

use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use threadvm::engine::Engine;
use threadvm::harness::{self, Handle, ScriptHost};
use threadvm::host::Host;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Fixture scenario to compile and run.
    #[arg(value_enum)]
    scenario: Scenario,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Add,
    CountThreshold,
    UnpackFirst,
    Capture,
    NestedClosure,
    GeneratorSum,
    Qs,
    Fannkuch,
    TypedHandler,
}

impl Scenario {
    /// Name `harness::fixture` looks this scenario up by.
    fn fixture_name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::CountThreshold => "count_threshold",
            Self::UnpackFirst => "unpack_first",
            Self::Capture => "capture",
            Self::NestedClosure => "nested_closure",
            Self::GeneratorSum => "generator_sum",
            Self::Qs => "qs",
            Self::Fannkuch => "fannkuch",
            Self::TypedHandler => "typed_handler",
        }
    }

    /// Build a representative argument list for this scenario against
    /// `host`. There is no host compiler here to parse real call-site
    /// arguments from, so each scenario ships its own demo input.
    fn demo_args(self, host: &mut ScriptHost) -> Vec<Handle> {
        match self {
            Self::Add => {
                let a = host.make_int(1);
                let b = host.make_int(2);
                vec![a, b]
            }
            Self::CountThreshold => {
                let limit = host.make_int(1000);
                let threshold = host.make_int(500);
                vec![limit, threshold]
            }
            Self::UnpackFirst => {
                let a = host.make_int(1);
                let b = host.make_int(2);
                let c = host.make_int(3);
                vec![host.make_tuple(vec![a, b, c])]
            }
            Self::Capture => {
                let zero = host.make_int(0);
                vec![host.make_tuple(vec![zero])]
            }
            Self::NestedClosure => vec![host.make_int(3)],
            Self::GeneratorSum => {
                let limit = host.make_int(1000);
                let threshold = host.make_int(490);
                vec![limit, threshold]
            }
            Self::Qs => {
                let values = [5i64, 3, 8, 1, 9, 2, 7].map(|v| host.make_int(v));
                vec![host.make_list(values.to_vec())]
            }
            Self::Fannkuch => vec![host.make_int(7)],
            Self::TypedHandler => vec![host.make_int(0)],
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let code = harness::fixture(args.scenario.fixture_name())
        .expect("Scenario and harness::fixture are kept in lockstep");

    let engine = Engine::new();
    let regcode = match engine.compile(&code) {
        Ok(regcode) => regcode,
        Err(e) => {
            eprintln!("compile error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut host = ScriptHost::new();
    let call_args = args.scenario.demo_args(&mut host);
    let globals = host.globals();
    let builtins = Some(host.builtins_handle());

    let result = engine.run(&mut host, &regcode, &call_args, &[], globals, builtins);
    for arg in &call_args {
        host.decref(*arg);
    }

    for line in host.output() {
        println!("{line}");
    }

    match result {
        Ok(handle) => {
            println!("{}", host.value(handle));
            host.decref(handle);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
