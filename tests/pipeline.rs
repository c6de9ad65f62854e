use std::fs;
use std::path::Path;

use calamine::{open_workbook, Reader, Xlsx};

use order_insight::config::InsightConfig;
use order_insight::history::HistoryStore;
use order_insight::pipeline;
use order_insight::report::SHEETS;

const EXPORT: &str = "\
订单编号,订单创建时间,总金额,宝贝标题,宝贝种类,宝贝总数量,买家会员名,收货地址,订单状态
o1,2024-01-01 10:00:00,30,番茄酱 500g，烤翅料 100g,2,2,u1,广东省 深圳市 南山区 科技园,交易成功
o2,2024-01-08 10:00:00,20,[Flash Sale]番茄酱 500g,1,1,u1,广东省 深圳市 南山区 科技园,交易成功
o3,2024-01-02 09:00:00,25,烤翅料 100g,1,1,u2,浙江省 杭州市 西湖区 文三路,交易成功
o4,2024-01-03 09:00:00,15,番茄酱 500g,1,1,u3,浙江省 杭州市 西湖区 文三路,交易关闭
o5,2024-01-04 09:00:00,12,unknown thing,1,1,u3,浙江省 杭州市 西湖区 文三路,交易成功
";

const CATALOG: &str = "\
title_clean,title_origin,product_id,title,channel,category
番茄酱 500g,番茄酱 500g,p1,番茄酱 500g,RT,ketchup
烤翅料 100g,烤翅料 100g,p2,烤翅料 100g,FS,wing seasoning
";

const REFINED: &str = "\
product_id,title_refined
p1,番茄酱
";

const REGIONS: &str = "\
province,city,district,tier
广东,深圳,南山区,T1
";

const CRM: &str = "\
user_id
u1
";

const PROMOTIONS: &str = "\
start_date,end_date,promotion,promo_type
2024-01-08,2024-01-08,New Year,small promotion
";

fn setup(dir: &Path) -> InsightConfig {
    let data = dir.join("data");
    fs::create_dir_all(&data).unwrap();
    for (name, body) in [
        ("orders.csv", EXPORT),
        ("catalog.csv", CATALOG),
        ("refined.csv", REFINED),
        ("regions.csv", REGIONS),
        ("crm.csv", CRM),
        ("promotions.csv", PROMOTIONS),
    ] {
        fs::write(data.join(name), body).unwrap();
    }

    let mut config = InsightConfig::default();
    config.inputs.new_orders = data.join("orders.csv");
    config.inputs.catalog = data.join("catalog.csv");
    config.inputs.refined_titles = data.join("refined.csv");
    config.inputs.regions = data.join("regions.csv");
    config.inputs.crm = Some(data.join("crm.csv"));
    config.inputs.promotions = Some(data.join("promotions.csv"));
    config.history.dir = dir.join("archive");
    config.output.dir = dir.join("report");
    config
}

#[test]
fn test_full_run_writes_history_and_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());

    let summary = pipeline::run(&config).unwrap();
    assert_eq!(summary.stats.raw_orders, 5);
    assert_eq!(summary.stats.valid_orders, 4);
    assert_eq!(summary.stats.valid_lines, 5);
    assert_eq!(summary.stats.usable_lines, 4);
    assert_eq!(summary.stats.usable_orders, 3);
    assert_eq!(summary.appended, 3);
    assert_eq!(summary.total_orders, 3);

    let book = HistoryStore::new(&config.history).load().unwrap();
    let mut u1: Vec<_> = book.orders.iter().filter(|o| o.user_id == "u1").collect();
    u1.sort_by_key(|o| o.nth_order);
    assert_eq!(u1.len(), 2);
    assert_eq!((u1[0].order_id.as_str(), u1[0].nth_order), ("o1", 1));
    assert_eq!((u1[1].order_id.as_str(), u1[1].nth_order), ("o2", 2));
    assert!(u1[1].is_rebuy);
    assert_eq!(u1[0].is_crm, "CRM");
    assert_eq!(u1[0].tier.as_deref(), Some("T1"));
    assert_eq!(u1[1].promo_type, "small promotion");

    let u2 = book.orders.iter().find(|o| o.user_id == "u2").unwrap();
    assert_eq!(u2.is_crm, "non-CRM");
    assert_eq!(u2.promo_type, "ordinary day");
    assert_eq!(u2.tier, None);

    // the bracketed campaign title still resolves
    let o2_line = book.lines.iter().find(|l| l.order_id == "o2").unwrap();
    assert_eq!(o2_line.product_id, "p1");
    assert_eq!(o2_line.title_refined.as_deref(), Some("番茄酱"));

    let mut report: Xlsx<_> = open_workbook(&summary.report).unwrap();
    assert_eq!(report.sheet_names(), SHEETS.to_vec());

    assert!(summary
        .diagrams
        .iter()
        .any(|d| d.svg.file_name().is_some_and(|n| n == "promo-path-3.svg")));
    for diagram in &summary.diagrams {
        assert!(fs::read_to_string(&diagram.dot).unwrap().starts_with("digraph"));
        assert_eq!(diagram.svg.parent(), diagram.dot.parent());
        assert!(fs::read_to_string(&diagram.svg).unwrap().contains("<svg"));
    }

    let export = summary.rfm_export.unwrap();
    assert_eq!(export.file_name().unwrap(), "rfm-2024-01-08.xlsx");
    assert!(export.exists());
}

#[test]
fn test_rerun_with_same_batch_appends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());

    pipeline::run(&config).unwrap();
    let first = HistoryStore::new(&config.history).load().unwrap();

    let summary = pipeline::run(&config).unwrap();
    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.appended, 0);
    assert_eq!(summary.total_orders, 3);

    let second = HistoryStore::new(&config.history).load().unwrap();
    assert_eq!(first.orders, second.orders);
    assert_eq!(first.lines.len(), second.lines.len());
}

#[test]
fn test_repeated_order_row_in_export_kept_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let repeated = format!(
        "{EXPORT}o3,2024-01-02 09:00:00,25,烤翅料 100g,1,1,u2,浙江省 杭州市 西湖区 文三路,交易成功\n"
    );
    fs::write(&config.inputs.new_orders, repeated).unwrap();

    let summary = pipeline::run(&config).unwrap();
    assert_eq!(summary.stats.raw_orders, 6);
    assert_eq!(summary.stats.duplicate_orders, 1);
    assert_eq!(summary.stats.valid_orders, 4);
    assert_eq!(summary.appended, 3);

    let book = HistoryStore::new(&config.history).load().unwrap();
    let o3: Vec<_> = book.orders.iter().filter(|o| o.order_id == "o3").collect();
    assert_eq!(o3.len(), 1);
    assert_eq!(o3[0].nth_order, 1);
    assert_eq!(book.lines.iter().filter(|l| l.order_id == "o3").count(), 1);
}

#[test]
fn test_promotion_name_containing_live_is_not_live() {
    let dir = tempfile::tempdir().unwrap();
    let config = setup(dir.path());
    let promotions = config.inputs.promotions.clone().unwrap();
    fs::write(
        promotions,
        "start_date,end_date,promotion,promo_type\n2024-01-08,2024-01-08,Delivery Festival,small promotion\n",
    )
    .unwrap();

    pipeline::run(&config).unwrap();
    let book = HistoryStore::new(&config.history).load().unwrap();
    let o2 = book.orders.iter().find(|o| o.order_id == "o2").unwrap();
    assert_eq!(o2.promotion, "Delivery Festival");
    assert_eq!(o2.promo_type, "small promotion");
}
