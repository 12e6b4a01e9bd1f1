//! BlueZ 后端 (bluer)
//!
//! - [`BluezResponder`]：注册 GATT 应用并发布广播，读写请求转发给 [`GattResponder`]
//! - [`BluezBeaconSource`]：BlueZ 设备发现，作为 [`DiscoveryScanner`](super::DiscoveryScanner) 的数据源
//!
//! BlueZ 自行决定广播包和扫描响应的划分；标准基 UUID 会被压缩为 16 位，
//! 身份段通常落在扫描响应中。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bluer::AdapterEvent;
use bluer::adv::{Advertisement as BluezAdvertisement, AdvertisementHandle, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, ReqError, Service,
};
use futures_util::{FutureExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::advertisement::Advertisement;
use super::client::BleError;
use super::scanner::{BeaconSource, RawBeacon};
use super::server::GattResponder;
use super::{MAIN_SERVICE_UUID, P2P_CHAR_UUID, STATUS_CHAR_UUID};

fn backend(e: bluer::Error) -> BleError {
    BleError::Backend(e.to_string())
}

async fn powered_adapter(session: &bluer::Session) -> Result<bluer::Adapter, BleError> {
    let adapter = session.default_adapter().await.map_err(|_| BleError::NoAdapter)?;
    debug!("Powering on adapter '{}'", adapter.name());
    adapter.set_powered(true).await.map_err(backend)?;
    Ok(adapter)
}

/// GATT 服务和广播，句柄释放时注销
pub struct BluezResponder {
    responder: Arc<GattResponder>,
    _advertisement: AdvertisementHandle,
    _application: ApplicationHandle,
    _session: bluer::Session,
}

impl BluezResponder {
    pub async fn start(responder: Arc<GattResponder>, adv: &Advertisement) -> Result<Self, BleError> {
        let session = bluer::Session::new().await.map_err(backend)?;
        let adapter = powered_adapter(&session).await?;

        let reader = responder.clone();
        let status = Characteristic {
            uuid: STATUS_CHAR_UUID,
            read: Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |req| {
                    let reader = reader.clone();
                    async move { Ok(reader.read_status(usize::from(req.offset))) }.boxed()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let writer = responder.clone();
        let p2p = Characteristic {
            uuid: P2P_CHAR_UUID,
            write: Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |value, req| {
                    let writer = writer.clone();
                    async move {
                        let device = req.device_address.to_string();
                        writer
                            .handle_write(&device, usize::from(req.offset), &value, false)
                            .map_err(|_| ReqError::Failed)
                    }
                    .boxed()
                })),
                ..Default::default()
            }),
            ..Default::default()
        };

        let application = adapter
            .serve_gatt_application(Application {
                services: vec![Service {
                    uuid: MAIN_SERVICE_UUID,
                    primary: true,
                    characteristics: vec![status, p2p],
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .map_err(backend)?;

        let beacon = adv.encode();
        let advertisement = adapter
            .advertise(BluezAdvertisement {
                advertisement_type: Type::Peripheral,
                service_uuids: BTreeSet::from([beacon.service_uuid]),
                service_data: beacon.service_data(),
                discoverable: Some(true),
                ..Default::default()
            })
            .await
            .map_err(backend)?;

        responder.start_advertising();
        info!(
            "Advertising as '{}' (sender id {}) on adapter '{}'",
            adv.name,
            adv.sender_id_hex(),
            adapter.name()
        );

        Ok(Self {
            responder,
            _advertisement: advertisement,
            _application: application,
            _session: session,
        })
    }
}

impl Drop for BluezResponder {
    fn drop(&mut self) {
        self.responder.stop();
    }
}

/// BlueZ 设备发现
pub struct BluezBeaconSource {
    session: bluer::Session,
}

impl BluezBeaconSource {
    pub async fn new() -> Result<Self, BleError> {
        let session = bluer::Session::new().await.map_err(backend)?;
        Ok(Self { session })
    }
}

#[async_trait]
impl BeaconSource for BluezBeaconSource {
    async fn start(&self) -> Result<mpsc::Receiver<RawBeacon>, BleError> {
        let adapter = powered_adapter(&self.session).await?;
        let events = adapter
            .discover_devices_with_changes()
            .await
            .map_err(backend)?;
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(addr) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(addr) else {
                    continue;
                };
                let service_data: HashMap<_, _> = match device.service_data().await {
                    Ok(Some(data)) if !data.is_empty() => data.into_iter().collect(),
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Failed to read service data from {}: {}", addr, e);
                        continue;
                    }
                };
                let beacon = RawBeacon {
                    address: addr.to_string(),
                    rssi: device.rssi().await.ok().flatten(),
                    service_data,
                };
                if tx.send(beacon).await.is_err() {
                    break;
                }
            }
            warn!("BlueZ discovery ended");
        });

        Ok(rx)
    }
}
