mod callback;
mod cpu;
mod debug_flags;
mod debugger;
mod machine;
mod memory;
mod remote;
mod savestate;
mod shutdown;

use machine::Machine;
use memory::Memory;
use remote::RemoteDebug;
use std::env;
use std::process;

fn parse_hex(arg: &str, what: &str) -> u16 {
    let digits = arg.trim_start_matches("0x").trim_start_matches('$');
    match u16::from_str_radix(digits, 16) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("{} must be a hex address, got '{}'", what, arg);
            process::exit(2);
        }
    }
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    // Flags:
    //   --listen <port>  => accept a remote debug session on 127.0.0.1:<port>
    //   --throttle       => pace execution at the nominal 1 MHz clock
    //   --cycles <N>     => stop after N emulated cycles
    //   --org <hex>      => load address for the image (default 8000)
    //   --entry <hex>    => reset vector target (default: org, unless the
    //                       image provides the vector itself)
    //   --break <hex>    => preset a breakpoint (repeatable)
    //   --help           => usage
    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        eprintln!(
            "Usage: {} [--listen PORT] [--throttle] [--cycles N] [--org HEX] [--entry HEX] [--break HEX]... <image>",
            args[0]
        );
        eprintln!("The image is a raw MC6809 binary loaded at --org.");
        return;
    }

    let mut listen: Option<u16> = None;
    let mut throttle = false;
    let mut cycle_limit: Option<u64> = None;
    let mut org: u16 = 0x8000;
    let mut entry: Option<u16> = None;
    let mut breakpoints: Vec<u16> = Vec::new();
    let mut image_arg: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" => {
                if i + 1 >= args.len() {
                    eprintln!("--listen requires a port");
                    process::exit(2);
                }
                match args[i + 1].parse::<u16>() {
                    Ok(port) => listen = Some(port),
                    Err(_) => {
                        eprintln!("--listen: bad port '{}'", args[i + 1]);
                        process::exit(2);
                    }
                }
                i += 2;
            }
            "--throttle" => {
                throttle = true;
                i += 1;
            }
            "--cycles" => {
                if i + 1 >= args.len() {
                    eprintln!("--cycles requires a value");
                    process::exit(2);
                }
                match args[i + 1].parse::<u64>() {
                    Ok(n) => cycle_limit = Some(n),
                    Err(_) => {
                        eprintln!("--cycles: bad value '{}'", args[i + 1]);
                        process::exit(2);
                    }
                }
                i += 2;
            }
            "--org" => {
                if i + 1 >= args.len() {
                    eprintln!("--org requires a value");
                    process::exit(2);
                }
                org = parse_hex(&args[i + 1], "--org");
                i += 2;
            }
            "--entry" => {
                if i + 1 >= args.len() {
                    eprintln!("--entry requires a value");
                    process::exit(2);
                }
                entry = Some(parse_hex(&args[i + 1], "--entry"));
                i += 2;
            }
            "--break" => {
                if i + 1 >= args.len() {
                    eprintln!("--break requires a value");
                    process::exit(2);
                }
                breakpoints.push(parse_hex(&args[i + 1], "--break"));
                i += 2;
            }
            s if s.starts_with('-') => {
                eprintln!("Unknown option: {}", s);
                process::exit(2);
            }
            s => {
                image_arg = Some(s.to_string());
                i += 1;
            }
        }
    }

    let image = match image_arg {
        Some(s) => s,
        None => {
            eprintln!("image argument missing");
            process::exit(2);
        }
    };

    let quiet = debug_flags::quiet();

    // Interrupts break into the debugger when a session is listening,
    // otherwise they quit.
    shutdown::install(listen.is_some());

    let memory = Memory::new_shared();
    let loaded = match memory.borrow_mut().load_image(&image, org) {
        Ok(len) => len,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    if !quiet {
        println!("Loaded {} bytes at {:04X} from {}", loaded, org, image);
    }

    // Point the reset vector at the chosen entry; an image that carries its
    // own vector is left alone unless --entry overrides it.
    match entry {
        Some(e) => memory.borrow_mut().set_reset_vector(e),
        None => {
            if !Memory::covers_reset_vector(org, loaded) {
                memory.borrow_mut().set_reset_vector(org);
            }
        }
    }

    let remote = match listen {
        Some(port) => {
            match RemoteDebug::bind(port, Memory::reader(&memory), Memory::writer(&memory)) {
                Ok(session) => Some(session),
                Err(e) => {
                    // run without remote debugging rather than refuse to start
                    eprintln!("remote debug unavailable: {}", e);
                    log::warn!("continuing without a debug session");
                    None
                }
            }
        }
        None => None,
    };
    if !quiet {
        if let Some(session) = remote.as_ref() {
            println!("Debug session listening on port {}", session.local_port());
        }
    }

    let mut machine = Machine::new(memory, remote, throttle);
    for addr in breakpoints {
        machine.debugger_mut().add_breakpoint(addr);
    }
    machine.reset();
    machine.run(cycle_limit);

    if !quiet {
        println!("stopped: {}", machine.cpu().snapshot());
    }
}
