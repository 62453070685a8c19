//! Mounts a nested API dispatcher, an HTML injector and an error layer
//! behind the junction server.
//!
//! Try:
//!   - /api/users/42
//!   - /api/fail (recovered by the error layer)
//!   - /index.html (served with the injected script)
//!   - /legacy/anything (answered by a plain service)
//!   - /nowhere (final handler 404)

use junction::inject::{self, Injector};
use junction::{
    Body, ConnectionInfo, DispatchConfig, Dispatcher, Error, Exchange, Handler, Listener, Next,
    Request, Response, Server, ServerConfig, StatusCode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn api() -> Dispatcher {
    let mut api = Dispatcher::new();

    api.register(
        "/users",
        Handler::request(|ex: Exchange, _next: Next| {
            let id = ex.path().trim_start_matches('/');
            ex.send(StatusCode::OK, format!("user {:?} (seen as {})", id, ex.url()))
        }),
    );

    api.register(
        "/fail",
        Handler::request(|_ex: Exchange, _next: Next| {
            Err(Error::with_status(StatusCode::BAD_GATEWAY, "upstream is down"))
        }),
    );

    api
}

fn main() -> std::io::Result<()> {
    let config = ServerConfig::new()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    let dispatch = DispatchConfig::new()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

    let hits = Arc::new(AtomicUsize::new(0));
    let mut app = Dispatcher::with_config(dispatch);

    // Counts every request, then continues.
    let counter = hits.clone();
    app.layer(
        Handler::request(move |_ex: Exchange, next: Next| {
            counter.fetch_add(1, Ordering::Relaxed);
            next.run();
            Ok(())
        })
        .named("counter"),
    );

    app.register("/api", api());

    app.layer(inject::layer(
        Injector::new(inject::script_tag("index.html", "/", false)),
        |path: &str| match path {
            "/" | "/index.html" => Some(
                "<!DOCTYPE html><html><head><title>junction</title></head><body>Hello</body></html>"
                    .to_owned(),
            ),
            _ => None,
        },
    ));

    app.register(
        "/legacy",
        Listener(|request: Request, _info: ConnectionInfo| {
            Response::new(Body::new(format!("legacy service saw {}", request.uri())))
        }),
    );

    let seen = hits.clone();
    app.layer(Handler::error(move |err: Error, ex: Exchange, _next: Next| {
        ex.send(
            err.status_code().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            format!(
                "recovered from {:?} after {} requests",
                err.to_string(),
                seen.load(Ordering::Relaxed)
            ),
        )
    }));

    let server = Server::from_config(config);
    println!("Server running at http://{}", server.addr());
    println!("Try these routes:");
    println!("  - /api/users/42");
    println!("  - /api/fail");
    println!("  - /index.html");
    println!("  - /legacy/anything");
    println!("  - /nowhere");

    server.run(app)
}
