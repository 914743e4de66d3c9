#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]
#![deny(clippy::large_stack_frames)]

use core::cell::RefCell;

use critical_section::Mutex;
use embassy_executor::Spawner;
use embassy_time::{Delay, Duration, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Level, Output, OutputConfig};
use esp_hal::handler;
use esp_hal::spi::master::{Config as SpiConfig, Spi};
use esp_hal::timer::PeriodicTimer;
use esp_hal::timer::timg::TimerGroup;
use esp_hal::{Blocking, time::Duration as HalDuration};
use log::{info, warn};
use rtt_target::rprintln;
use static_cell::StaticCell;

use wattlog_core::aggregator::Aggregator;
use wattlog_core::backlog::BacklogStore;
use wattlog_core::calibration::Calibration;
use wattlog_core::config::{DeviceIdentity, PersistedSettings, PipelineConfig, begin_session};
use wattlog_core::http::HttpUplink;
use wattlog_core::queue::{FrameQueue, SampleQueues};
use wattlog_core::sampler::{MonotonicClock, SampleSource};
use wattlog_core::transmit::TransmissionManager;
use wattlog_firmware::adc::EspAdcFrontEnd;
use wattlog_firmware::identity::BoardIdentity;
use wattlog_firmware::net::{CollectorDiscovery, TcpConnector, start_wifi};
use wattlog_firmware::sd_medium::{FixedTime, SdCardMedium};
use wattlog_firmware::secrets::configured_collector;

/// Raw sample queue depth; about 2.5 s of samples at 5 ms
const RAW_QUEUE: usize = 512;
const MARKER_QUEUE: usize = 16;
const FRAME_QUEUE: usize = 32;

const UPLINK_SOCKET_BUF: usize = 2048;
const PROBE_SOCKET_BUF: usize = 512;

/// Largest share of the SD card the logger may fill
const STORAGE_QUOTA: u64 = 256 * 1024 * 1024;

type SdSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
type Medium = SdCardMedium<SdSpi, Delay, FixedTime>;
type Sampler = SampleSource<'static, EspAdcFrontEnd, MonotonicClock, RAW_QUEUE, MARKER_QUEUE>;
type WindowAggregator = Aggregator<'static, RAW_QUEUE, MARKER_QUEUE, FRAME_QUEUE>;
type Manager = TransmissionManager<
    'static,
    TcpConnector<UPLINK_SOCKET_BUF>,
    CollectorDiscovery<PROBE_SOCKET_BUF>,
    Medium,
    FRAME_QUEUE,
>;

static SAMPLE_QUEUES: StaticCell<SampleQueues<RAW_QUEUE, MARKER_QUEUE>> = StaticCell::new();
static FRAMES: FrameQueue<FRAME_QUEUE> = FrameQueue::new();

static SAMPLER: Mutex<RefCell<Option<Sampler>>> = Mutex::new(RefCell::new(None));
static SAMPLE_TIMER: Mutex<RefCell<Option<PeriodicTimer<'static, Blocking>>>> =
    Mutex::new(RefCell::new(None));

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
// For more information see: <https://docs.espressif.com/projects/esp-idf/en/stable/esp32/api-reference/system/app_image_format.html#application-description>
esp_bootloader_esp_idf::esp_app_desc!();

#[handler]
fn sample_tick() {
    critical_section::with(|cs| {
        if let Some(timer) = SAMPLE_TIMER.borrow_ref_mut(cs).as_mut() {
            timer.clear_interrupt();
        }
        if let Some(sampler) = SAMPLER.borrow_ref_mut(cs).as_mut() {
            sampler.on_tick();
        }
    });
}

#[embassy_executor::task]
async fn aggregator_task(aggregator: WindowAggregator) {
    aggregator.run().await
}

#[embassy_executor::task]
async fn transmit_task(manager: Manager) {
    manager.run().await
}

#[allow(
    clippy::large_stack_frames,
    reason = "it's not unusual to allocate larger buffers etc. in main"
)]
#[esp_rtos::main]
async fn main(spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(#[esp_hal::ram(reclaimed)] size: 73744);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    rprintln!("Embassy initialized!");

    let pipeline = PipelineConfig::default();

    // SD card on SPI2
    let spi_bus = Spi::new(peripherals.SPI2, SpiConfig::default())
        .expect("Failed to configure SPI2")
        .with_sck(peripherals.GPIO12)
        .with_mosi(peripherals.GPIO11)
        .with_miso(peripherals.GPIO13);
    let cs = Output::new(peripherals.GPIO10, Level::High, OutputConfig::default());
    let sd_spi = ExclusiveDevice::new(spi_bus, cs, Delay).expect("Failed to claim SD chip select");
    let sd_card = embedded_sdmmc::SdCard::new(sd_spi, Delay);
    let mut medium = SdCardMedium::new(sd_card, FixedTime, STORAGE_QUOTA);
    info!("SD card ready, quota {} bytes", medium.quota());

    let settings = match begin_session(&mut medium) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Could not persist session counter: {}", e);
            PersistedSettings::default()
        }
    };
    let backlog = BacklogStore::open(medium).expect("Failed to open backlog");

    let (stack, mac) = start_wifi(&spawner, peripherals.WIFI).expect("Failed to initialize Wi-Fi");
    let identity = BoardIdentity::new(mac, settings.session_id);
    info!(
        "Device {} starting session {}",
        identity.device_id(),
        identity.session_id()
    );

    // Acquisition
    let queues = SAMPLE_QUEUES.init(SampleQueues::new());
    let (producer, consumer) = queues.split();

    let adc = EspAdcFrontEnd::new(peripherals.ADC1, peripherals.GPIO1, peripherals.GPIO2);
    let mut sampler = SampleSource::new(adc, MonotonicClock, producer, pipeline.chunk_size as u16);
    sampler.arm();
    critical_section::with(|cs| *SAMPLER.borrow_ref_mut(cs) = Some(sampler));

    let aggregator = Aggregator::new(
        consumer,
        &FRAMES,
        Calibration::default(),
        pipeline.chunk_size,
        pipeline.sample_period_ms,
        identity.session_id(),
    );
    spawner
        .spawn(aggregator_task(aggregator))
        .expect("aggregator_task spawn");

    // Transmission
    let uplink = HttpUplink::new(
        TcpConnector::new(stack, pipeline.exchange_timeout),
        identity.device_id(),
        pipeline.upload_path,
        pipeline.connect_timeout,
        pipeline.exchange_timeout,
    );
    let probe = HttpUplink::new(
        TcpConnector::new(stack, pipeline.connect_timeout),
        identity.device_id(),
        pipeline.upload_path,
        pipeline.connect_timeout,
        pipeline.connect_timeout,
    );
    let discovery = CollectorDiscovery::new(probe, configured_collector());
    let manager =
        TransmissionManager::new(&FRAMES, uplink, discovery, backlog, pipeline).with_settings(settings);
    spawner
        .spawn(transmit_task(manager))
        .expect("transmit_task spawn");

    // Start sampling last so the consumers are already running
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    let mut timer = PeriodicTimer::new(timg1.timer0);
    timer.set_interrupt_handler(sample_tick);
    critical_section::with(|cs| {
        timer
            .start(HalDuration::from_millis(u64::from(pipeline.sample_period_ms)))
            .expect("Failed to start sample timer");
        timer.listen();
        *SAMPLE_TIMER.borrow_ref_mut(cs) = Some(timer);
    });

    info!("Sampling every {} ms", pipeline.sample_period_ms);

    loop {
        Timer::after(Duration::from_secs(60)).await;
        info!(
            "Heap: {} used, {} free",
            esp_alloc::HEAP.used(),
            esp_alloc::HEAP.free()
        );
    }
}
