use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use zold::farm::Farm;
use zold::node::entrance::Entrance;
use zold::node::front::Front;
use zold::node::metronome::{Metronome, PERIOD};
use zold::node::{MetronomeStats, NodeContext};
use zold::remotes::Remotes;
use zold::score::STRENGTH;
use zold::wallet::parse_invoice;
use zold::wallets::Wallets;

fn main() {
    env_logger::init();

    let mut invoice: Option<String> = None;
    let mut host = "127.0.0.1".to_string();
    let mut port: u16 = 4096;
    let mut bind_port: Option<u16> = None;
    let mut home = PathBuf::from(".");
    let mut network = zold::NETWORK.to_string();
    let mut threads: usize = 4;
    let mut strength: usize = STRENGTH;
    let mut halt_code = String::new();
    let mut standalone = false;
    let mut ignore_score_weakness = false;
    let mut never_reboot = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--invoice" => invoice = args.next(),
            "--host" => host = args.next().expect("missing value for --host"),
            "--port" => {
                port = args
                    .next()
                    .expect("missing value for --port")
                    .parse()
                    .expect("invalid --port")
            }
            "--bind-port" => {
                bind_port = Some(
                    args.next()
                        .expect("missing value for --bind-port")
                        .parse()
                        .expect("invalid --bind-port"),
                )
            }
            "--home" => home = PathBuf::from(args.next().expect("missing value for --home")),
            "--network" => network = args.next().expect("missing value for --network"),
            "--threads" => {
                threads = args
                    .next()
                    .expect("missing value for --threads")
                    .parse()
                    .expect("invalid --threads")
            }
            "--strength" => {
                strength = args
                    .next()
                    .expect("missing value for --strength")
                    .parse()
                    .expect("invalid --strength")
            }
            "--halt-code" => halt_code = args.next().expect("missing value for --halt-code"),
            "--standalone" => standalone = true,
            "--ignore-score-weakness" => ignore_score_weakness = true,
            "--never-reboot" => never_reboot = true,
            _ => {
                eprintln!("unknown arg {}", arg);
                std::process::exit(1);
            }
        }
    }

    let invoice = invoice.expect("missing --invoice (like NOPREFIX@ffffffffffffffff)");
    parse_invoice(&invoice).expect("invalid --invoice");

    let farm = Farm::start(&home, &host, port, &invoice, threads, strength)
        .expect("can't start the farm");
    let remotes = if standalone {
        Remotes::standalone()
    } else {
        Remotes::new(&home)
    };
    let entrance = Entrance::new(home.clone(), &network);

    let ctx = Arc::new(NodeContext {
        network,
        host,
        port,
        wallets: Wallets::new(&home),
        home,
        remotes,
        farm,
        entrance,
        metronome: MetronomeStats::default(),
        strength,
        halt_code,
        ignore_score_weakness,
        never_reboot,
        alive: AtomicBool::new(true),
        started: Instant::now(),
    });

    let bind = format!("0.0.0.0:{}", bind_port.unwrap_or(port));
    let listener = TcpListener::bind(&bind).expect("can't bind the front");
    let front = Front::start(Arc::clone(&ctx), listener).expect("can't start the front");
    let metronome = Metronome::start(Arc::clone(&ctx), PERIOD);

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))
        .expect("can't register SIGTERM");
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))
        .expect("can't register SIGINT");

    while ctx.is_alive() {
        if term.load(std::sync::atomic::Ordering::Relaxed) {
            ctx.request_shutdown("signal received");
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    ctx.farm.stop();
    metronome.join();
    front.join();
}
