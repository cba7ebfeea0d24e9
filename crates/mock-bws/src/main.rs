use mock_bws::MockBws;

#[tokio::main]
async fn main() {
    let port = std::env::var("MOCK_BWS_PORT").unwrap_or_else(|_| "4000".to_string());
    let organization =
        std::env::var("MOCK_BWS_ORGANIZATION").unwrap_or_else(|_| "mock-organization".to_string());

    println!("MOCK-BWS: Generating RSA-2048 keys...");
    let mock = MockBws::new(&organization)
        .with_secret("3e5a3f0d-0b8e-4d5e-9d1c-1f2b9c8a7e01", "database-password", "hunter2")
        .with_secret("7c1d0c6e-55a4-4a57-8e0b-2f5f6e4d3c02", "api-key", "sk-mock-123");

    println!("MOCK-BWS: BWS_ACCESS_TOKEN={}", mock.access_token());
    let (app, _state) = mock.router();

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await.unwrap();
    println!("MOCK-BWS: Listening on http://localhost:{port}");
    println!("MOCK-BWS: BWS_IDENTITY_URL=BWS_API_URL=http://localhost:{port}");
    axum::serve(listener, app).await.unwrap();
}
