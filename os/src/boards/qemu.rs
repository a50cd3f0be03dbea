use pmm::IoRegion;

/// Device windows identity mapped into every address space.
pub static MMIO: [IoRegion; 3] = [
    // VIRT_UART0
    IoRegion::new(0x1000_0000, 0x1000_1000),
    // VIRT_VIRTIO
    IoRegion::new(0x1000_1000, 0x1000_2000),
    // VIRT_PLIC
    IoRegion::new(0x0C00_0000, 0x0C40_0000),
];
