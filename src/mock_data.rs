//! Built-in ERP sample tables, seeded at startup so there is something to ask
//! about before the first upload.

use crate::registry::{Provenance, TableMetadata};
use crate::value::{CellValue, Row};

pub struct MockTable {
    pub name: &'static str,
    pub comment: &'static str,
    pub description: &'static str,
    /// (physical column, comment)
    pub columns: &'static [(&'static str, &'static str)],
    pub rows: &'static [&'static [&'static str]],
    pub sample_questions: &'static [&'static str],
}

impl MockTable {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.to_string()).collect()
    }

    pub fn to_rows(&self) -> Vec<Row> {
        self.rows
            .iter()
            .map(|values| {
                self.columns
                    .iter()
                    .zip(values.iter())
                    .map(|((name, _), value)| {
                        let cell = if value.is_empty() {
                            CellValue::Null
                        } else {
                            CellValue::Text(value.to_string())
                        };
                        (name.to_string(), cell)
                    })
                    .collect()
            })
            .collect()
    }

    pub fn metadata(&self, row_count: usize) -> TableMetadata {
        let mut meta = TableMetadata::new(self.name, self.comment, self.column_names(), row_count, Provenance::Mock);
        meta.description = self.description.to_string();
        meta.table_comment = Some(self.comment.to_string());
        meta.column_comments = self
            .columns
            .iter()
            .map(|(name, comment)| (name.to_string(), comment.to_string()))
            .collect();
        meta.sample_questions = self.sample_questions.iter().map(|q| q.to_string()).collect();
        meta
    }
}

pub fn mock_tables() -> Vec<MockTable> {
    vec![
        MockTable {
            name: "erp_customers",
            comment: "客户信息",
            description: "ERP 客户主数据",
            columns: &[
                ("customer_id", "客户编号"),
                ("customer_name", "客户名称"),
                ("region", "所在地区"),
                ("level", "客户等级"),
                ("created_date", "建档日期"),
            ],
            rows: &[
                &["C001", "华东贸易有限公司", "华东", "A", "2023-01-15"],
                &["C002", "北方机械集团", "华北", "B", "2023-03-02"],
                &["C003", "南海电子科技", "华南", "A", "2023-05-20"],
                &["C004", "西部农产品合作社", "西南", "C", "2023-07-11"],
                &["C005", "东方零售连锁", "华东", "B", "2024-01-08"],
            ],
            sample_questions: &[
                "每个地区有多少客户？",
                "A 级客户有哪些？",
                "2023 年新建档的客户有多少？",
                "客户等级分布如何？",
            ],
        },
        MockTable {
            name: "erp_products",
            comment: "产品目录",
            description: "ERP 产品主数据",
            columns: &[
                ("product_id", "产品编号"),
                ("product_name", "产品名称"),
                ("category", "产品类别"),
                ("unit_price", "单价"),
                ("in_stock", "是否有库存"),
            ],
            rows: &[
                &["P001", "工业传感器", "电子元件", "320.00", "true"],
                &["P002", "液压泵", "机械设备", "1580.00", "true"],
                &["P003", "控制面板", "电子元件", "860.50", "false"],
                &["P004", "包装纸箱", "耗材", "3.20", "true"],
                &["P005", "轴承套件", "机械设备", "145.00", "true"],
            ],
            sample_questions: &[
                "单价最高的产品是什么？",
                "每个类别有多少产品？",
                "哪些产品目前缺货？",
                "电子元件的平均单价是多少？",
            ],
        },
        MockTable {
            name: "erp_sales_orders",
            comment: "销售订单",
            description: "ERP 销售订单明细",
            columns: &[
                ("order_id", "订单编号"),
                ("customer_id", "客户编号"),
                ("product_id", "产品编号"),
                ("quantity", "数量"),
                ("amount", "订单金额"),
                ("order_date", "下单日期"),
                ("status", "订单状态"),
            ],
            rows: &[
                &["SO1001", "C001", "P001", "10", "3200.00", "2024-03-01", "已完成"],
                &["SO1002", "C002", "P002", "2", "3160.00", "2024-03-03", "已完成"],
                &["SO1003", "C003", "P003", "5", "4302.50", "2024-03-07", "已发货"],
                &["SO1004", "C001", "P004", "500", "1600.00", "2024-03-10", "已完成"],
                &["SO1005", "C005", "P005", "20", "2900.00", "2024-03-12", "待付款"],
                &["SO1006", "C004", "P004", "200", "640.00", "2024-03-15", "已取消"],
                &["SO1007", "C002", "P001", "4", "1280.00", "2024-03-18", "已发货"],
                &["SO1008", "C003", "P002", "1", "1580.00", "2024-03-21", "已完成"],
            ],
            sample_questions: &[
                "3 月份的总销售额是多少？",
                "销售额最高的客户是谁？",
                "各订单状态的订单数量是多少？",
                "哪个产品卖得最多？",
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_tables_are_well_formed() {
        for table in mock_tables() {
            for row in table.rows {
                assert_eq!(row.len(), table.columns.len(), "{}", table.name);
            }
            let meta = table.metadata(table.rows.len());
            meta.validate().unwrap();
            assert_eq!(meta.provenance, Provenance::Mock);
            assert_eq!(table.to_rows().len(), table.rows.len());
        }
    }
}
