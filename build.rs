fn main() {
    // One unary method carrying codec envelopes for every RPC
    let transport = tonic_build::manual::Service::builder()
        .name("RaftTransport")
        .package("ballot.rpc")
        .method(
            tonic_build::manual::Method::builder()
                .name("call")
                .route_name("Call")
                .input_type("crate::codec::Envelope")
                .output_type("crate::codec::Envelope")
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        )
        .build();

    tonic_build::manual::Builder::new().compile(&[transport]);
}
