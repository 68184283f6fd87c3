/// Shared HTTP plumbing for the controller and the two detectors.
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Bind `host:port` and serve `app` until SIGINT/SIGTERM.
pub async fn run(service: &'static str, host: &str, port: u16, app: Router) -> std::io::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    serve_on(service, listener, app, crate::signals::shutdown_signal()).await
}

/// Serve `app` on an already-bound listener until `shutdown` resolves.
pub async fn serve_on<F>(
    service: &'static str,
    listener: TcpListener,
    app: Router,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    tracing::info!(service, "listening on http://{local_addr}");

    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!(service, "stopped");
    Ok(())
}

/// Bind an ephemeral local port and serve `app` in the background.
/// Returns the base URL, e.g. `http://127.0.0.1:41234`.
#[cfg(test)]
pub async fn spawn_test_server(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = serve_on("test", listener, app, std::future::pending()).await;
    });
    (format!("http://{addr}"), handle)
}
