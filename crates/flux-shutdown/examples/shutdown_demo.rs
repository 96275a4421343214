use flux_shutdown::{ShutdownLatch, SignalHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() {
    println!("=== 一次性关闭闩示例（Ctrl+C 退出，5 秒后自动触发）===\n");

    let latch = Arc::new(ShutdownLatch::new());
    let signals = SignalHandler::new(latch.clone());

    tokio::spawn(async move {
        match signals.wait_for_system_signal().await {
            Ok(signal) => println!("收到信号: {:?}", signal),
            Err(e) => println!("安装信号处理失败: {}", e),
        }
    });

    let auto = latch.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(5)).await;
        println!("自动触发: {}", auto.trigger());
    });

    latch.wait().await;

    // 重复触发不会再执行清理
    println!("再次触发: {}", latch.trigger());
    println!("清理完成");
}
