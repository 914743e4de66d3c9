//! Wi-Fi station, network stack and the TCP side of the collector uplink

use alloc::string::String;

use embassy_executor::Spawner;
use embassy_net::tcp::{ConnectError, TcpSocket};
use embassy_net::{Config as NetConfig, DhcpConfig, IpAddress, IpEndpoint, Ipv4Address, Stack, StackResources};
use embassy_time::{Duration, Timer};
use esp_hal::{peripherals::WIFI, rng::Rng};
use esp_radio::{
    Controller as RadioController, init as radio_init,
    wifi::{self, ClientConfig, ModeConfig, WifiController, WifiDevice, WifiEvent},
};
use log::{debug, info, warn};
use static_cell::StaticCell;

use wattlog_core::TransportError;
use wattlog_core::config::ServerAddress;
use wattlog_core::http::{Connection, Connector, HttpUplink};
use wattlog_core::transmit::Discovery;

use crate::secrets::{WIFI_PASSWORD, WIFI_SSID};

/// DHCP plus one uplink socket and one discovery socket
const SOCKET_COUNT: usize = 4;

/// Polls waiting for an IPv4 configuration after association
const CONFIG_UP_RETRIES: u8 = 30;

static RADIO_CONTROLLER: StaticCell<RadioController<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<SOCKET_COUNT>> = StaticCell::new();

/// Brings up the radio and network stack and spawns their tasks.
///
/// Returns the stack and the station MAC address, or `None` when the radio
/// cannot be initialised.
pub fn start_wifi(spawner: &Spawner, wifi_peripheral: WIFI<'static>) -> Option<(Stack<'static>, [u8; 6])> {
    let radio = match radio_init() {
        Ok(ctrl) => ctrl,
        Err(err) => {
            warn!("Wi-Fi radio init failed: {:?}", err);
            return None;
        }
    };
    let radio_ctrl = RADIO_CONTROLLER.init(radio);

    let (controller, interfaces) = match wifi::new(radio_ctrl, wifi_peripheral, Default::default()) {
        Ok(v) => v,
        Err(err) => {
            warn!("Wi-Fi driver init failed: {:?}", err);
            return None;
        }
    };

    let device: WifiDevice<'static> = interfaces.sta;
    let mac = device.mac_address();

    let rng = Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;

    let resources = NET_RESOURCES.init(StackResources::<SOCKET_COUNT>::new());
    let (stack, runner) = embassy_net::new(
        device,
        NetConfig::dhcpv4(DhcpConfig::default()),
        resources,
        seed,
    );

    if let Err(err) = spawner.spawn(wifi_task(controller, stack)) {
        warn!("wifi_task spawn failed: {:?}", err);
        return None;
    }
    if let Err(err) = spawner.spawn(net_task(runner)) {
        warn!("net_task spawn failed: {:?}", err);
        return None;
    }

    Some((stack, mac))
}

#[embassy_executor::task]
async fn net_task(mut runner: embassy_net::Runner<'static, WifiDevice<'static>>) {
    runner.run().await;
}

/// Keeps the station associated, reconnecting after every drop.
#[embassy_executor::task]
async fn wifi_task(mut controller: WifiController<'static>, stack: Stack<'static>) {
    info!("Wi-Fi task starting (ssid=\"{}\")", WIFI_SSID);

    let client_config = ModeConfig::Client(
        ClientConfig::default()
            .with_ssid(String::from(WIFI_SSID))
            .with_password(String::from(WIFI_PASSWORD)),
    );

    loop {
        if !matches!(controller.is_started(), Ok(true)) {
            if let Err(err) = controller.set_config(&client_config) {
                warn!("Wi-Fi set_config error: {:?}", err);
                Timer::after(Duration::from_secs(10)).await;
                continue;
            }
            if let Err(err) = controller.start_async().await {
                warn!("Wi-Fi start_async error: {:?}", err);
                Timer::after(Duration::from_secs(10)).await;
                continue;
            }
        }

        if let Err(err) = controller.connect_async().await {
            warn!("Wi-Fi connect error: {:?}", err);
            Timer::after(Duration::from_secs(10)).await;
            continue;
        }

        let mut retries = 0u8;
        while !stack.is_config_up() && retries < CONFIG_UP_RETRIES {
            retries += 1;
            Timer::after(Duration::from_millis(500)).await;
        }
        match stack.config_v4() {
            Some(cfg) => info!("Wi-Fi link up: ip={}", cfg.address.address()),
            None => warn!("Wi-Fi associated but DHCP did not complete"),
        }

        controller.wait_for_event(WifiEvent::StaDisconnected).await;
        warn!("Wi-Fi STA disconnected; will retry");
        Timer::after(Duration::from_secs(5)).await;
    }
}

fn endpoint(addr: ServerAddress) -> IpEndpoint {
    let [a, b, c, d] = addr.ip;
    IpEndpoint::new(IpAddress::Ipv4(Ipv4Address::new(a, b, c, d)), addr.port)
}

fn map_connect_error(e: ConnectError) -> TransportError {
    match e {
        ConnectError::ConnectionReset => TransportError::Refused,
        ConnectError::TimedOut => TransportError::ConnectTimeout,
        ConnectError::NoRoute => TransportError::Unreachable,
        _ => TransportError::Reset,
    }
}

/// Opens TCP connections through the embassy-net stack.
///
/// Owns the socket buffers; only one connection can be open at a time.
pub struct TcpConnector<const N: usize> {
    stack: Stack<'static>,
    rx: [u8; N],
    tx: [u8; N],
    socket_timeout: Duration,
}

impl<const N: usize> TcpConnector<N> {
    pub fn new(stack: Stack<'static>, socket_timeout: Duration) -> Self {
        Self {
            stack,
            rx: [0; N],
            tx: [0; N],
            socket_timeout,
        }
    }

    pub fn stack(&self) -> Stack<'static> {
        self.stack
    }
}

impl<const N: usize> Connector for TcpConnector<N> {
    type Connection<'a> = TcpConnection<'a>;

    async fn connect(&mut self, addr: ServerAddress) -> Result<TcpConnection<'_>, TransportError> {
        if !self.stack.is_config_up() {
            return Err(TransportError::Unreachable);
        }

        let mut socket = TcpSocket::new(self.stack, &mut self.rx, &mut self.tx);
        socket.set_timeout(Some(self.socket_timeout));
        socket.connect(endpoint(addr)).await.map_err(map_connect_error)?;
        Ok(TcpConnection { socket })
    }
}

pub struct TcpConnection<'a> {
    socket: TcpSocket<'a>,
}

impl Connection for TcpConnection<'_> {
    async fn write_all(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            let n = self
                .socket
                .write(data)
                .await
                .map_err(|_| TransportError::Reset)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            data = &data[n..];
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.socket.read(buf).await.map_err(|_| TransportError::Reset)
    }

    async fn close(&mut self) {
        self.socket.close();
        if self.socket.flush().await.is_err() {
            self.socket.abort();
        }
    }
}

/// Finds a collector that answers `GET /ping`.
///
/// Tries the hint first, then the address configured at build time.
pub struct CollectorDiscovery<const N: usize> {
    probe: HttpUplink<TcpConnector<N>>,
    configured: Option<ServerAddress>,
}

impl<const N: usize> CollectorDiscovery<N> {
    pub fn new(probe: HttpUplink<TcpConnector<N>>, configured: Option<ServerAddress>) -> Self {
        Self { probe, configured }
    }

    async fn answers(&mut self, addr: ServerAddress) -> bool {
        match self.probe.ping(addr).await {
            Ok(alive) => alive,
            Err(e) => {
                debug!("Ping {} failed: {}", addr, e);
                false
            }
        }
    }
}

impl<const N: usize> Discovery for CollectorDiscovery<N> {
    async fn verified_server_address(&mut self, hint: Option<ServerAddress>) -> Option<ServerAddress> {
        if !self.probe.connector_mut().stack().is_config_up() {
            return None;
        }

        if let Some(addr) = hint {
            if self.answers(addr).await {
                return Some(addr);
            }
        }
        match self.configured {
            Some(addr) if Some(addr) != hint => self.answers(addr).await.then_some(addr),
            _ => None,
        }
    }
}
