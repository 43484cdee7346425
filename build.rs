fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Vendored protoc so builds don't depend on a system install.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    // serde derives on every generated type so the JSON bridge and the
    // snapshot layer reuse the wire types directly. `serde(default)` is
    // message-level (enums can't carry it), so each message is listed.
    let messages = [
        "Entity",
        "Label",
        "Controller",
        "Lifetime",
        "Geo",
        "Orientation",
        "Kinematics",
        "Vector3",
        "Symbol",
        "Track",
        "Transponder",
        "Adsb",
        "Ais",
        "Detection",
        "Bearing",
        "Camera",
        "Classification",
        "Administrative",
        "Navigation",
        "Mission",
        "Position",
        "Polyline",
        "Polygon",
        "Shape",
        "Device",
        "UsbAddress",
        "SerialAddress",
        "IpAddress",
        "Configurable",
        "Config",
        "DeviceSelector",
        "EntityFilter",
        "StreamBehavior",
        "EntityChange",
        "Pairing",
        "PushRequest",
        "PushOutcome",
        "PushResponse",
        "GetEntityRequest",
        "GetEntityResponse",
        "ListEntitiesRequest",
        "ListEntitiesResponse",
        "WatchEntitiesRequest",
        "ExpireEntityRequest",
        "ExpireEntityResponse",
        "RunTaskRequest",
        "RunTaskResponse",
        "GetLocalNodeRequest",
        "GetLocalNodeResponse",
        "ReconcileRequest",
        "GetTimelineRequest",
        "MoveTimelineRequest",
        "MoveTimelineResponse",
    ];

    let mut builder = tonic_build::configure()
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]");
    for message in messages {
        builder = builder.type_attribute(
            format!(".hydris.v1.{message}"),
            "#[serde(default, rename_all = \"camelCase\")]",
        );
    }
    builder.compile_protos(&["proto/hydris/v1/world.proto"], &["proto"])?;

    Ok(())
}
