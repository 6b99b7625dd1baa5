//! Minimal worker for exercising the supervisor: answers every request with
//! its pid and worker index.

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::Context;
use log::info;
use serde_json::json;
use sticky_pool::logging::{init_logging, LoggingConfig};
use sticky_pool::worker_runtime::{Instruction, WorkerRuntime};

struct Identity {
    pid: u32,
    worker_index: u64,
}

async fn echo(req: HttpRequest, identity: web::Data<Identity>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "pid": identity.pid,
        "worker": identity.worker_index,
        "path": req.path(),
    }))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let mut runtime = WorkerRuntime::from_env()?;
    init_logging(LoggingConfig {
        title: runtime
            .options()
            .title
            .as_ref()
            .map(|title| format!("{} worker", title)),
        ..Default::default()
    });

    let identity = web::Data::new(Identity {
        pid: std::process::id(),
        worker_index: runtime.options().worker_index,
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(identity.clone())
            .default_service(web::to(echo))
    })
    .workers(1)
    .disable_signals()
    .bind(("127.0.0.1", 0))?;
    let port = server
        .addrs()
        .first()
        .map(|addr| addr.port())
        .context("server bound no address")?;
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);

    runtime.listening(port).await?;
    runtime.ready().await?;
    info!("Listening on 127.0.0.1:{}", port);

    match runtime.next_instruction().await {
        Instruction::Die(grace) => {
            info!("Draining within {:?}", grace);
            if tokio::time::timeout(grace, handle.stop(true)).await.is_err() {
                handle.stop(false).await;
            }
        }
        Instruction::SupervisorGone => handle.stop(false).await,
    }
    Ok(())
}
