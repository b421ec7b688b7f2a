// The whole control plane is one cooperatively-scheduled thread; children are
// separate OS processes.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let code = procwatch::wd::cli::run().await;
    std::process::exit(code);
}
