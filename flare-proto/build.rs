//! 编译 `proto/` 下的协议定义，生成消息类型与 gRPC 客户端 / 服务端代码

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let protos = [
        "proto/gateway.proto",
        "proto/online.proto",
        "proto/message.proto",
    ];

    for proto in protos {
        println!("cargo:rerun-if-changed={proto}");
    }

    tonic_prost_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_protos(&protos, &["proto"])?;

    Ok(())
}
