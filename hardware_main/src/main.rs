#![no_std]
#![no_main]

mod fmt;
mod health;
mod mail_link;
mod rtclock;
mod settings_store;
mod temp_sensor;
mod uplink;

// Use declarations
// Core libraries
use core::cell::RefCell;

// External libraries
#[cfg(feature = "defmt")]
use {defmt_rtt as _, panic_probe as _};
use embassy_executor::Spawner;
use embassy_stm32::{bind_interrupts, exti::ExtiInput, peripherals, usart};
use embassy_stm32::{flash::Flash, gpio::{Level, Output, Pull, Speed}, i2c::{ErrorInterruptHandler, EventInterruptHandler, I2c}, rtc::{Rtc, RtcConfig}, time::Hertz, usart::Uart, Config};
use embassy_sync::blocking_mutex::{Mutex, raw::ThreadModeRawMutex};
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
#[cfg(not(feature = "defmt"))]
use panic_halt as _;
use static_cell::StaticCell;

// Internal modules, both this crate and the business logic crate.
use business_logic::config::Quantity;
use business_logic::monitor::Monitor;
use business_logic::notification::Envelope;
use business_logic::scheduler::{MailRelay, Scheduler, SharedMonitor};
use fmt::{error, info, unwrap, warn};
use mail_link::LinkMailer;
use rtclock::{Rtclock, SampleTicker};
use settings_store::SettingsStore;
use temp_sensor::{GreenhouseSensor, greenhouse_sensor};
use uplink::{OUTBOX_DEPTH, Uplink};

type Outbox = Channel<ThreadModeRawMutex, Envelope, OUTBOX_DEPTH>;

// Alert envelopes from the sampling loop to the mail task.
static OUTBOX: Outbox = Channel::new();
// Raised to stop the sampling loop; the loop answers on LOOP_STOPPED.
static STOP: Signal<ThreadModeRawMutex, ()> = Signal::new();
static LOOP_STOPPED: Signal<ThreadModeRawMutex, ()> = Signal::new();

static MONITOR: StaticCell<SharedMonitor<ThreadModeRawMutex>> = StaticCell::new();
static CLOCK: StaticCell<Rtclock> = StaticCell::new();

bind_interrupts!(struct Irqs {
    I2C1_EV => EventInterruptHandler<peripherals::I2C1>;
    I2C1_ER => ErrorInterruptHandler<peripherals::I2C1>;
    USART1 => usart::InterruptHandler<peripherals::USART1>;
    USART3 => usart::InterruptHandler<peripherals::USART3>;
});

#[embassy_executor::main]
async fn main(spawner: Spawner) {

    // Chip peripheral configuration
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        use embassy_stm32::rcc::mux::{Adcsel, Clk48sel, I2c1sel};

        // Default for Config.rcc is hse=None, hsi=false, SAI1,2=None
        config.rcc.msi = Some(MSIRange::RANGE4M); // Multi-speed Osc. = 4 MHz

        // PLL creates 48 MHz at its output (PLLCLK).
        config.rcc.pll = Some(Pll {
            source: PllSource::MSI,
            prediv: PllPreDiv::DIV1,
            mul: PllMul::MUL24,
            divp: None, // Only feeds the serial audio interface, which is unused.
            divq: Some(PllQDiv::DIV2),
            divr: Some(PllRDiv::DIV2), // for sysclk of 48 MHz
        });

        // Clock busses
        config.rcc.sys = Sysclk::PLL1_R; // 48 MHz, reported as health::SYSCLK_HZ
        config.rcc.ahb_pre = AHBPrescaler::DIV1; // HCLK = 48 MHz
        config.rcc.apb1_pre = APBPrescaler::DIV1;
        config.rcc.apb2_pre = APBPrescaler::DIV1;

        // Low-speed oscillators
        config.rcc.ls = LsConfig {
            rtc: RtcClockSource::LSE,
            lsi: false, // Not using LSI for either watchdog or RTC.
            lse: Some(LseConfig { frequency: Hertz(32768), mode: LseMode::Oscillator(LseDrive::Low) }),
        };

        config.rcc.mux.adcsel = Adcsel::SYS;
        config.rcc.mux.clk48sel = Clk48sel::PLLSAI1_Q;
        config.rcc.mux.i2c1sel = I2c1sel::PCLK1;
    }
    let p = embassy_stm32::init(config);

    // GPIOs
    let sensor_nen = Output::new(p.PA15, Level::High, Speed::Low); // Sensor power enable, active low.
    let led = Output::new(p.PB0, Level::High, Speed::Low);
    let btn = ExtiInput::new(p.PB5, p.EXTI5, Pull::Up);

    // RTC initialization
    let mut rtc = Rtc::new(p.RTC, RtcConfig::default());
    rtc.set_daylight_savings(false);
    let rt_clock = if Rtclock::is_running(&rtc) {
        info!("RTC is running, using existing RTCW value...");
        Rtclock::from_running(rtc)
    } else {
        info!("RTC not running, initializing...");
        Rtclock::from_rtcw(rtc, 0)
    };
    let clock: &'static Rtclock = CLOCK.init(rt_clock);
    info!("RTCW {}", clock.get_rtcw());

    // Settings from flash, defaults when the page is blank or corrupt.
    let mut store = SettingsStore::new(Flash::new_blocking(p.FLASH));
    let settings = store.load_or_default();

    let started_at = clock.get_timestamp();
    let monitor: &'static SharedMonitor<ThreadModeRawMutex> =
        MONITOR.init(Mutex::new(RefCell::new(Monitor::new(settings, started_at))));

    // I2C and sensor initialization.
    let i2c = I2c::new(
        p.I2C1,
        p.PB6,
        p.PB7,
        Irqs,
        p.DMA1_CH6,
        p.DMA1_CH7,
        Hertz(400_000),
        Default::default(),
    );
    let sensor = greenhouse_sensor(i2c, sensor_nen);

    // Serial links to the network co-processor: requests on USART1, mail on USART3.
    let uplink_uart = unwrap!(Uart::new(
        p.USART1,
        p.PA10,
        p.PA9,
        Irqs,
        p.DMA1_CH4,
        p.DMA1_CH5,
        usart::Config::default(),
    ));
    let mail_uart = unwrap!(Uart::new(
        p.USART3,
        p.PC5,
        p.PC4,
        Irqs,
        p.DMA1_CH2,
        p.DMA1_CH3,
        usart::Config::default(),
    ));
    let mailer = LinkMailer::new(mail_uart, mail_link::SEND_TIMEOUT);
    let uplink = Uplink::new(uplink_uart, monitor, OUTBOX.sender(), clock, store);

    unwrap!(spawner.spawn(sampler(monitor, sensor, OUTBOX.sender(), clock)));
    unwrap!(spawner.spawn(mail(monitor, OUTBOX.receiver(), mailer, clock)));
    unwrap!(spawner.spawn(uplink_task(uplink)));
    unwrap!(spawner.spawn(led_blink(led, monitor)));
    unwrap!(spawner.spawn(button(btn)));

    info!("greenhouse monitor started at {}", started_at.seconds);
}

/// Stop the sampling loop, let its current tick finish, then reset.
async fn restart_after_stop() -> ! {
    STOP.signal(());
    LOOP_STOPPED.wait().await;
    warn!("restarting");
    Timer::after(Duration::from_millis(100)).await; // Let the last log lines drain.
    cortex_m::peripheral::SCB::sys_reset()
}

#[embassy_executor::task]
async fn sampler(
    monitor: &'static SharedMonitor<ThreadModeRawMutex>,
    sensor: GreenhouseSensor,
    outbox: Sender<'static, ThreadModeRawMutex, Envelope, OUTBOX_DEPTH>,
    clock: &'static Rtclock,
) {
    let mut scheduler = Scheduler::new(monitor, sensor, outbox);
    let mut ticks = SampleTicker::new(clock);
    scheduler.run(&mut ticks, &STOP).await;
    LOOP_STOPPED.signal(());
}

#[embassy_executor::task]
async fn mail(
    monitor: &'static SharedMonitor<ThreadModeRawMutex>,
    inbox: Receiver<'static, ThreadModeRawMutex, Envelope, OUTBOX_DEPTH>,
    mailer: LinkMailer,
    clock: &'static Rtclock,
) {
    let mut relay = MailRelay::new(monitor, inbox, mailer);
    loop {
        let outcome = relay.relay_one(clock).await;
        if outcome.success {
            info!("mail delivered after {} attempt(s)", outcome.attempts);
        }
    }
}

#[embassy_executor::task]
async fn uplink_task(mut uplink: Uplink) {
    loop {
        match uplink.serve_one().await {
            Ok(false) => {}
            Ok(true) => restart_after_stop().await,
            Err(_) => {
                error!("uplink read/write failed");
                Timer::after(Duration::from_millis(50)).await;
            }
        }
    }
}

/// Heartbeat: slow blink when all is well, fast blink while any alarm is active.
#[embassy_executor::task]
async fn led_blink(mut led: Output<'static>, monitor: &'static SharedMonitor<ThreadModeRawMutex>) {
    loop {
        let alarmed = monitor.lock(|cell| {
            let monitor = cell.borrow();
            Quantity::ALL.into_iter().any(|q| monitor.alarm_state(q).level.is_alarm())
        });
        let half_period = Duration::from_millis(if alarmed { 125 } else { 500 });
        led.set_high();
        Timer::after(half_period).await;
        led.set_low();
        Timer::after(half_period).await;
    }
}

/// Service button: a press stops sampling cleanly and restarts the device.
#[embassy_executor::task]
async fn button(mut btn: ExtiInput<'static>) {
    btn.wait_for_falling_edge().await;
    info!("service button pressed");
    // Debounce delay
    Timer::after(Duration::from_millis(50)).await;
    restart_after_stop().await
}
