//! The real relay and model clients against local stand-in servers.

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpResponse, HttpServer, web};
use serde_json::{Value, json};

use hairswap_gateway::GatewayError;
use hairswap_gateway::artifact::TempArtifact;
use hairswap_gateway::gradio::{BlendOptions, FileRef, GradioClient, InferenceClient, Slot};
use hairswap_gateway::relay::{DEFAULT_DOWNLOAD_BASE, Relay, TmpfilesRelay};

fn serve(routes: fn(&mut web::ServiceConfig)) -> (String, ServerHandle) {
    let server = HttpServer::new(move || App::new().configure(routes))
        .workers(1)
        .bind(("127.0.0.1", 0))
        .unwrap();
    let addr = server.addrs()[0];
    let server = server.run();
    let handle = server.handle();
    actix_web::rt::spawn(server);
    (format!("http://{addr}"), handle)
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_bytes())
}

async fn tmpfiles_upload(body: web::Bytes) -> HttpResponse {
    if !contains(&body, r#"name="file""#) || !contains(&body, r#"filename="resized.jpg""#) {
        return HttpResponse::BadRequest().body("missing file part");
    }
    HttpResponse::Ok().json(json!({
        "status": "success",
        "data": { "url": "https://tmpfiles.org/7731/resized.jpg" },
    }))
}

fn tmpfiles_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/upload", web::post().to(tmpfiles_upload))
        .route(
            "/broken/upload",
            web::post().to(|| async { HttpResponse::InternalServerError().body("boom") }),
        )
        .route(
            "/plain/upload",
            web::post().to(|| async { HttpResponse::Ok().body("https://tmpfiles.org/dl/5/resized.jpg\n") }),
        );
}

#[actix_web::test]
async fn relay_uploads_and_normalizes() {
    let (base, handle) = serve(tmpfiles_routes);
    let relay = TmpfilesRelay::new(
        reqwest::Client::new(),
        &format!("{base}/api/v1/upload"),
        DEFAULT_DOWNLOAD_BASE,
    );

    let url = relay.upload(&TempArtifact::memory(b"jpeg".to_vec())).await.unwrap();
    assert_eq!(url, "https://tmpfiles.org/dl/7731/resized.jpg");

    handle.stop(true).await;
}

#[actix_web::test]
async fn relay_reads_disk_artifacts_and_plain_bodies() {
    let (base, handle) = serve(tmpfiles_routes);
    let dir = tempfile::tempdir().unwrap();
    let relay = TmpfilesRelay::new(
        reqwest::Client::new(),
        &format!("{base}/plain/upload"),
        DEFAULT_DOWNLOAD_BASE,
    );

    let artifact = TempArtifact::disk(Some(dir.path()), b"jpeg").unwrap();
    let url = relay.upload(&artifact).await.unwrap();
    assert_eq!(url, "https://tmpfiles.org/dl/5/resized.jpg");

    handle.stop(true).await;
}

#[actix_web::test]
async fn relay_surfaces_status_and_body() {
    let (base, handle) = serve(tmpfiles_routes);
    let relay = TmpfilesRelay::new(
        reqwest::Client::new(),
        &format!("{base}/broken/upload"),
        DEFAULT_DOWNLOAD_BASE,
    );

    let err = relay
        .upload(&TempArtifact::memory(b"jpeg".to_vec()))
        .await
        .unwrap_err();
    match err {
        GatewayError::Status { status, body, .. } => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }

    handle.stop(true).await;
}

async fn queue(body: web::Json<Value>, path: web::Path<String>) -> HttpResponse {
    let data = body["data"].as_array().cloned().unwrap_or_default();
    let api = path.into_inner();
    let accepted = match api.as_str() {
        "swap_hair" => {
            data.len() == 6
                && data[0]["meta"]["_type"] == "gradio.FileData"
                && data[3] == "Article"
                && data[4] == 2500
                && data[5] == 100
        }
        "resize_inner_1" => data.len() == 2 && data[1] == json!(["Shape"]),
        _ => true,
    };
    if !accepted {
        return HttpResponse::UnprocessableEntity().body(format!("bad payload for {api}"));
    }
    HttpResponse::Ok().json(json!({ "event_id": format!("{api}-1") }))
}

async fn stream(path: web::Path<(String, String)>) -> HttpResponse {
    let (api, _event_id) = path.into_inner();
    let body = match api.as_str() {
        "swap_hair" => concat!(
            "event: generating\ndata: null\n\n",
            "event: complete\n",
            "data: [{\"visible\": false, \"value\": null}, ",
            "{\"visible\": true, \"value\": {\"path\": \"/tmp/gradio/out.png\", \"url\": \"https://space.test/gradio_api/file=/tmp/gradio/out.png\"}}]\n\n",
        ),
        "resize_inner_1" => "event: complete\ndata: [{\"path\": \"/tmp/gradio/aligned.png\"}]\n\n",
        _ => "event: error\ndata: null\n\n",
    };
    HttpResponse::Ok().content_type("text/event-stream").body(body)
}

async fn gradio_upload(body: web::Bytes) -> HttpResponse {
    if !contains(&body, r#"name="files""#) {
        return HttpResponse::BadRequest().finish();
    }
    HttpResponse::Ok().json(json!(["/tmp/gradio/abc/hairswap.jpg"]))
}

fn gradio_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/gradio_api/upload", web::post().to(gradio_upload))
        .route("/gradio_api/call/{api}", web::post().to(queue))
        .route("/gradio_api/call/{api}/{event_id}", web::get().to(stream));
}

#[actix_web::test]
async fn swap_call_goes_through_the_queue() {
    let (base, handle) = serve(gradio_routes);
    let client = GradioClient::new(reqwest::Client::new(), &base);
    let file = FileRef::Url("https://tmpfiles.org/dl/1/resized.jpg".into());

    let output = client
        .swap(&file, &file, &file, &BlendOptions::default())
        .await
        .unwrap();
    assert_eq!(
        output.into_file().unwrap(),
        FileRef::Url("https://space.test/gradio_api/file=/tmp/gradio/out.png".into())
    );

    handle.stop(true).await;
}

#[actix_web::test]
async fn upload_then_resize_returns_model_path() {
    let (base, handle) = serve(gradio_routes);
    let client = GradioClient::new(reqwest::Client::new(), &base);
    let dir = tempfile::tempdir().unwrap();
    let staged = TempArtifact::disk(Some(dir.path()), b"jpeg").unwrap();

    let uploaded = client.upload(&staged).await.unwrap();
    assert_eq!(uploaded, FileRef::Path("/tmp/gradio/abc/hairswap.jpg".into()));

    let aligned = client.resize(Slot::Shape, &uploaded).await.unwrap();
    assert_eq!(aligned, FileRef::Path("/tmp/gradio/aligned.png".into()));
    assert_eq!(
        client.file_url(&aligned),
        format!("{base}/gradio_api/file=/tmp/gradio/aligned.png")
    );

    handle.stop(true).await;
}

#[actix_web::test]
async fn error_event_fails_the_call() {
    let (base, handle) = serve(gradio_routes);
    let client = GradioClient::new(reqwest::Client::new(), &base);

    let err = client
        .resize(Slot::Face, &FileRef::Url("https://x/a.jpg".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::RemoteInference(_)));
    assert!(err.to_string().contains("remote model reported an error"));

    handle.stop(true).await;
}
