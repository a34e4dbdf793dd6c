//! BLE peripheral face of the bridge.
//!
//! Instantiates the GATT mirror's tree as local BLE attributes via
//! BlueZ. Central writes are forwarded into the mirror; mirror
//! notifications are pushed to whichever characteristics the central
//! has subscribed to. The Zwift Ride UUID is deliberately absent from
//! the advertisement — Zwift finds it through mDNS/TCP — while CSC,
//! Cycling Power, Heart Rate and FTMS are advertised like a real bike.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bluer::{
    adv::Advertisement,
    gatt::local::{
        Application, Characteristic, CharacteristicNotify, CharacteristicNotifyMethod,
        CharacteristicRead, CharacteristicWrite, CharacteristicWriteMethod, ReqError, Service,
    },
};
use futures::FutureExt;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::mirror::{GattMirror, MirrorError};
use crate::tnp::{PROP_INDICATE, PROP_NOTIFY, PROP_READ, PROP_WRITE};
use crate::uuids;

// Connection interval hints: 160-250 x 1.25 ms.
const MIN_CONN_INTERVAL: Duration = Duration::from_micros(200_000);
const MAX_CONN_INTERVAL: Duration = Duration::from_micros(312_500);

type NotifierMap = Arc<Mutex<HashMap<Uuid, bluer::gatt::local::CharacteristicNotifier>>>;

/// Run the BLE GATT server until the adapter goes away.
pub async fn run(mirror: Arc<GattMirror>, device_name: String) -> bluer::Result<()> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    info!(
        "BLE using adapter {} ({})",
        adapter.name(),
        adapter.address().await?
    );

    let adv = Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids: [
            uuids::CSC_SERVICE_UUID,
            uuids::CYCLING_POWER_SERVICE_UUID,
            uuids::HEART_RATE_SERVICE_UUID,
            uuids::FTMS_SERVICE_UUID,
        ]
        .into_iter()
        .collect(),
        local_name: Some(device_name.clone()),
        discoverable: Some(true),
        min_interval: Some(MIN_CONN_INTERVAL),
        max_interval: Some(MAX_CONN_INTERVAL),
        ..Default::default()
    };
    let _adv_handle = adapter.advertise(adv).await?;
    info!("advertising as '{}'", device_name);

    let ble_session = mirror.allocate_session();
    let (tx, mut rx) = GattMirror::notification_channel();
    mirror.add_sink(ble_session, tx);

    let notifiers: NotifierMap = Arc::new(Mutex::new(HashMap::new()));

    let mut services = Vec::new();
    for svc in mirror.services() {
        let mut characteristics = Vec::new();
        for (uuid, properties) in svc.characteristics {
            characteristics.push(build_characteristic(
                &mirror,
                &notifiers,
                ble_session,
                uuid,
                properties,
            ));
        }
        services.push(Service {
            uuid: svc.uuid,
            primary: true,
            characteristics,
            ..Default::default()
        });
    }

    let service_count = services.len();
    let app = Application { services, ..Default::default() };
    let _app_handle = adapter.serve_gatt_application(app).await?;
    info!("GATT application registered ({} services)", service_count);

    // Forward mirror notifications to the subscribed central. This task
    // is the only caller of the notifiers, so BLE writes are serialized.
    while let Some(n) = rx.recv().await {
        let mut notifiers = notifiers.lock().await;
        let Some(notifier) = notifiers.get_mut(&n.uuid) else { continue };
        if notifier.is_stopped() {
            notifiers.remove(&n.uuid);
            mirror.unsubscribe(ble_session, &n.uuid);
            continue;
        }
        if let Err(e) = notifier.notify(n.value).await {
            warn!("BLE notification error on {}: {}", n.uuid, e);
            notifiers.remove(&n.uuid);
            mirror.unsubscribe(ble_session, &n.uuid);
        }
    }

    Ok(())
}

fn build_characteristic(
    mirror: &Arc<GattMirror>,
    notifiers: &NotifierMap,
    ble_session: crate::mirror::SessionId,
    uuid: Uuid,
    properties: u8,
) -> Characteristic {
    let mut chr = Characteristic { uuid, ..Default::default() };

    if properties & PROP_READ != 0 {
        let mirror = mirror.clone();
        chr.read = Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |_req| {
                let mirror = mirror.clone();
                async move {
                    debug!("BLE read on {}", uuid);
                    mirror.value(&uuid).map_err(|_| ReqError::Failed)
                }
                .boxed()
            }),
            ..Default::default()
        });
    }

    if properties & PROP_WRITE != 0 {
        let mirror = mirror.clone();
        chr.write = Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |value, _req| {
                let mirror = mirror.clone();
                async move {
                    debug!("BLE write on {}: {:02x?}", uuid, value);
                    mirror.write(&uuid, &value).map_err(|e| match e {
                        MirrorError::NotSupported => ReqError::NotSupported,
                        MirrorError::ValueTooLong => ReqError::InvalidValueLength,
                        _ => ReqError::Failed,
                    })
                }
                .boxed()
            })),
            ..Default::default()
        });
    }

    if properties & (PROP_NOTIFY | PROP_INDICATE) != 0 {
        let mirror = mirror.clone();
        let notifiers = notifiers.clone();
        chr.notify = Some(CharacteristicNotify {
            notify: properties & PROP_NOTIFY != 0,
            indicate: properties & PROP_INDICATE != 0,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let mirror = mirror.clone();
                let notifiers = notifiers.clone();
                async move {
                    info!(
                        "BLE notification session on {} (confirming={})",
                        uuid,
                        notifier.confirming()
                    );
                    if mirror.subscribe(ble_session, &uuid).is_ok() {
                        notifiers.lock().await.insert(uuid, notifier);
                    }
                }
                .boxed()
            })),
            ..Default::default()
        });
    }

    chr
}
