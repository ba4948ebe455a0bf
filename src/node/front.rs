// The HTTP front: request surface of the node. Every response carries the
// protocol headers; middleware enforces network/protocol agreement, parses
// the X-Zold-Score header and registers strong peers; `?halt=` with the
// configured code shuts the node down. Handler errors map to 400/404/503 and
// never kill the process.

use crate::error::{Error, Result};
use crate::id::Id;
use crate::node::http::{read_request, write_response, Request};
use crate::node::NodeContext;
use crate::score::Score;
use crate::txn::format_time;
use chrono::Utc;
use log::{debug, error, info};
use serde_json::json;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Peer scores weaker than this value are not worth registering.
const MIN_REGISTER_VALUE: usize = 3;

struct Resp {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
    location: Option<String>,
}

impl Resp {
    fn text(status: u16, body: impl Into<String>) -> Resp {
        Resp {
            status,
            content_type: "text/plain",
            body: body.into().into_bytes(),
            location: None,
        }
    }

    fn json(status: u16, value: serde_json::Value) -> Resp {
        Resp {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
            location: None,
        }
    }

    fn redirect(location: &str) -> Resp {
        Resp {
            status: 302,
            content_type: "text/plain",
            body: Vec::new(),
            location: Some(location.to_string()),
        }
    }
}

pub struct Front {
    handle: thread::JoinHandle<()>,
    port: u16,
}

impl Front {
    /// Accept loop in its own thread; each connection is served by a
    /// short-lived worker thread.
    pub fn start(ctx: Arc<NodeContext>, listener: TcpListener) -> Result<Front> {
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        let handle = thread::Builder::new()
            .name("front".to_string())
            .spawn(move || {
                info!("HTTP front listening on port {}", port);
                while ctx.is_alive() {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            let ctx = Arc::clone(&ctx);
                            thread::spawn(move || serve(ctx, stream, peer.ip().to_string()));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(25));
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
                info!("HTTP front stopped");
            })
            .expect("spawn front thread");
        Ok(Front { handle, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn serve(ctx: Arc<NodeContext>, mut stream: TcpStream, peer_ip: String) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(4)));
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(e) => {
            debug!("Unreadable request from {}: {}", peer_ip, e);
            return;
        }
    };
    debug!("{} {} from {}", request.method, request.path, peer_ip);
    let resp = route(&ctx, &request).unwrap_or_else(|e| match e {
        Error::Validation(msg) => Resp::text(400, msg),
        Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
            Resp::text(404, e.to_string())
        }
        other => {
            error!(
                "Unhandled failure in {} {}: {}",
                request.method, request.path, other
            );
            Resp::text(503, format!("{:?}", other))
        }
    });

    let best = ctx.best_score();
    let mut headers = vec![
        ("X-Zold-Version".to_string(), crate::VERSION.to_string()),
        ("X-Zold-Protocol".to_string(), crate::PROTOCOL.to_string()),
        ("X-Zold-Score".to_string(), best.to_header()),
        ("Access-Control-Allow-Origin".to_string(), "*".to_string()),
        ("Cache-Control".to_string(), "no-cache".to_string()),
        ("Connection".to_string(), "close".to_string()),
        ("Content-Type".to_string(), resp.content_type.to_string()),
    ];
    if let Some(location) = &resp.location {
        headers.push(("Location".to_string(), location.clone()));
    }
    write_response(&mut stream, resp.status, &headers, &resp.body);
}

fn route(ctx: &NodeContext, request: &Request) -> Result<Resp> {
    if let Some(resp) = middleware(ctx, request)? {
        return Ok(resp);
    }
    let peer_score = incoming_score(ctx, request)?;

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => Ok(Resp::json(200, status_json(ctx)?)),
        ("GET", "/version") => Ok(Resp::text(200, crate::VERSION)),
        ("GET", "/pid") => Ok(Resp::text(200, std::process::id().to_string())),
        ("GET", "/score") => Ok(Resp::text(200, ctx.best_score().to_string())),
        ("GET", "/remotes") => {
            let all: Vec<_> = ctx
                .remotes
                .all()?
                .into_iter()
                .map(|r| {
                    json!({
                        "host": r.host,
                        "port": r.port,
                        "score": r.score,
                        "errors": r.errors,
                    })
                })
                .collect();
            Ok(Resp::json(200, json!({ "all": all })))
        }
        ("GET", "/farm") => Ok(Resp::text(200, ctx.farm.to_text())),
        ("GET", "/metronome") => Ok(Resp::text(200, ctx.metronome.to_text())),
        ("GET", "/robots.txt") => Ok(Resp::text(200, "User-agent: *")),
        ("GET", "/favicon.ico") => {
            let value = ctx.best_score().value();
            let color = if value >= 16 {
                "green"
            } else if value >= 4 {
                "orange"
            } else {
                "red"
            };
            Ok(Resp::redirect(&format!(
                "https://www.zold.io/images/logo-{}.png",
                color
            )))
        }
        ("GET", path) if path.starts_with("/wallet/") => wallet_get(ctx, path),
        ("PUT", path) if path.starts_with("/wallet/") => {
            wallet_put(ctx, path, request, peer_score)
        }
        _ => Ok(Resp::text(404, "Not found")),
    }
}

/// Pre-request checks; `Some` short-circuits the route.
fn middleware(ctx: &NodeContext, request: &Request) -> Result<Option<Resp>> {
    if let Some(code) = request.query.get("halt") {
        if !ctx.halt_code.is_empty() && code == &ctx.halt_code {
            ctx.request_shutdown("halt code matched");
            return Ok(Some(Resp::text(200, "Shutting down")));
        }
        return Ok(Some(Resp::text(400, "Wrong halt code")));
    }
    if let Some(network) = request.header("X-Zold-Network") {
        if network != ctx.network {
            return Ok(Some(Resp::text(
                400,
                format!("Wrong network {:?}, we are in {:?}", network, ctx.network),
            )));
        }
    }
    if let Some(protocol) = request.header("X-Zold-Protocol") {
        if protocol != crate::PROTOCOL.to_string() {
            return Ok(Some(Resp::text(
                400,
                format!("Wrong protocol {:?}, we speak {}", protocol, crate::PROTOCOL),
            )));
        }
    }
    Ok(None)
}

/// Parse and vet the X-Zold-Score header, registering strong peers.
fn incoming_score(ctx: &NodeContext, request: &Request) -> Result<Option<Score>> {
    let header = match request.header("X-Zold-Score") {
        Some(header) => header,
        None => return Ok(None),
    };
    let score = Score::parse_header(header)
        .map_err(|e| Error::validation(format!("invalid score header: {}", e)))?;
    if !score.valid() {
        return Err(Error::validation("score header does not validate"));
    }
    if score.strength < ctx.strength && !ctx.ignore_score_weakness {
        return Err(Error::validation(format!(
            "score strength {} is below the required {}",
            score.strength, ctx.strength
        )));
    }
    if score.value() > MIN_REGISTER_VALUE && !score.expired(Utc::now()) {
        ctx.remotes.add(&score.host, score.port)?;
        ctx.remotes.rescore(&score.host, score.port, score.value() as u64)?;
    }
    Ok(Some(score))
}

fn status_json(ctx: &NodeContext) -> Result<serde_json::Value> {
    let best = ctx.best_score();
    let remotes = ctx.remotes.all()?;
    let nscore: u64 = best.value() as u64 + remotes.iter().map(|r| r.score).sum::<u64>();
    Ok(json!({
        "version": crate::VERSION,
        "network": ctx.network,
        "protocol": crate::PROTOCOL,
        "score": best.to_json(),
        "pid": std::process::id(),
        "cpus": num_cpus::get(),
        "uptime": ctx.uptime_secs(),
        "threads": ctx.farm.threads(),
        "wallets": ctx.wallets.count()?,
        "remotes": remotes.len(),
        "nscore": nscore,
        "farm": ctx.farm.to_json(),
        "entrance": ctx.entrance.to_json(),
    }))
}

fn wallet_get(ctx: &NodeContext, path: &str) -> Result<Resp> {
    let rest = path.strip_prefix("/wallet/").unwrap_or_default();
    if let Some(stem) = rest.strip_suffix(".json") {
        let wallet = found(ctx, stem)?;
        let body = wallet.body()?;
        return Ok(Resp::json(
            200,
            json!({
                "id": body.id,
                "network": body.network,
                "protocol": body.protocol,
                "key": body.key.to_text(),
                "mtime": format_time(wallet.mtime()?),
                "digest": wallet.digest()?,
            }),
        ));
    }
    if let Some(stem) = rest.strip_suffix(".txt") {
        let wallet = found(ctx, stem)?;
        return Ok(Resp::text(200, wallet.to_text()?));
    }
    if let Some((stem, op)) = rest.split_once('/') {
        let wallet = found(ctx, stem)?;
        return match op {
            "balance" => Ok(Resp::text(200, wallet.balance()?.to_string())),
            "key" => Ok(Resp::text(200, wallet.key()?.to_pub_pem())),
            "mtime" => Ok(Resp::text(200, format_time(wallet.mtime()?))),
            "digest" => Ok(Resp::text(200, wallet.digest()?)),
            _ => Ok(Resp::text(404, "Not found")),
        };
    }
    let wallet = found(ctx, rest)?;
    let body = wallet.body()?;
    Ok(Resp::json(
        200,
        json!({
            "id": body.id,
            "network": body.network,
            "protocol": body.protocol,
            "balance": body.balance()?.zents(),
            "txns": body.txns.len(),
            "age": wallet.age()?,
            "mtime": format_time(wallet.mtime()?),
            "digest": wallet.digest()?,
            "score": ctx.best_score().to_json(),
            "body": wallet.body()?.to_text(),
        }),
    ))
}

fn wallet_put(
    ctx: &NodeContext,
    path: &str,
    request: &Request,
    peer_score: Option<Score>,
) -> Result<Resp> {
    let rest = path.strip_prefix("/wallet/").unwrap_or_default();
    let id: Id = rest
        .parse()
        .map_err(|_| Error::validation(format!("invalid wallet id {:?}", rest)))?;
    let body = String::from_utf8(request.body.clone())
        .map_err(|_| Error::validation("pushed body is not UTF-8"))?;
    let source =
        peer_score.map(|score| (score.host.clone(), score.port, score.value() as u64));
    let modified = ctx.entrance.push(id, &body, source)?;
    if modified.is_empty() {
        return Ok(Resp::text(304, ""));
    }
    Ok(Resp::json(
        200,
        json!({
            "id": id,
            "modified": modified,
            "score": ctx.best_score().to_json(),
        }),
    ))
}

fn found(ctx: &NodeContext, stem: &str) -> Result<crate::wallet::Wallet> {
    let id: Id = stem
        .parse()
        .map_err(|_| Error::validation(format!("invalid wallet id {:?}", stem)))?;
    let wallet = ctx.wallets.wallet(id);
    if !wallet.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("wallet {} is not here", id),
        )));
    }
    Ok(wallet)
}
